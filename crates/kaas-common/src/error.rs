//! Error types for the control plane
//!
//! Errors carry the entity they concern plus enough context to be useful in
//! a task's recorded error detail. Every variant maps onto one of four
//! categories via [`Error::category`], which is what the task engine uses to
//! decide between retrying and terminating.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Broad classification of a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Host API unavailability, timeouts, store contention. Retried.
    Transient,
    /// Invalid plan, malformed node config, cyclic hierarchy. Never retried.
    Permanent,
    /// Some resources applied, others not. Resolved by re-applying.
    PartialFailure,
    /// Token issuance failure. Fails closed, never retried.
    Identity,
}

impl ErrorCategory {
    /// Whether the task engine should schedule another attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::PartialFailure)
    }
}

/// Main error type for control-plane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the host or a virtual cluster
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Request rejected before any work was scheduled
    #[error("validation error for {entity}: {message}")]
    Validation {
        /// Entity the request concerned (workspace, project or group id)
        entity: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "dedicatedNodes.count")
        field: Option<String>,
    },

    /// Referenced entity does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind (workspace, project, group, user, task)
        kind: &'static str,
        /// Entity id
        id: String,
    },

    /// Virtual-cluster provisioning failure
    #[error("provision error for {workspace}: {message}")]
    Provision {
        /// Workspace being provisioned
        workspace: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Some resources of a multi-step apply succeeded and some did not
    #[error("partial apply for {workspace} at step {step}: {message}")]
    PartialApply {
        /// Workspace being mutated
        workspace: String,
        /// Step that failed (namespace, nodes, quota, virtual-cluster)
        step: String,
        /// Description of what failed
        message: String,
    },

    /// Namespace hierarchy failure
    #[error("hierarchy error for {project}: {message}")]
    Hierarchy {
        /// Project (namespace) the error concerns
        project: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A bounded wait expired
    #[error("timed out after {}s: {operation}", after.as_secs())]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long we waited
        after: Duration,
    },

    /// Token issuance or verification failure
    #[error("authentication error: {message}")]
    Authentication {
        /// Description of why authentication failed
        message: String,
    },

    /// Relational store failure
    #[error("store error: {message}")]
    Store {
        /// Description of what failed
        message: String,
        /// Store is unusable and the process must stop
        fatal: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "engine", "poll_until")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            entity: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with entity context
    pub fn validation_for(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with entity context and field name
    pub fn validation_for_field(
        entity: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a retryable provision error
    pub fn provision(workspace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            workspace: workspace.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provision error (e.g., unknown plan)
    pub fn provision_permanent(workspace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            workspace: workspace.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a partial-apply error
    pub fn partial_apply(
        workspace: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PartialApply {
            workspace: workspace.into(),
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable hierarchy error
    pub fn hierarchy(project: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hierarchy {
            project: project.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable hierarchy error (e.g., anchor Forbidden)
    pub fn hierarchy_permanent(project: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hierarchy {
            project: project.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
        }
    }

    /// Create a recoverable store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            fatal: false,
        }
    }

    /// Create a store error that must stop the process
    pub fn store_fatal(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            fatal: true,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with kind context
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error
    ///
    /// Kubernetes 4xx responses are permanent except for conflicts (409),
    /// which happen under concurrent server-side apply, and throttling (429).
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => {
                    ErrorCategory::Transient
                }
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => ErrorCategory::Permanent,
                _ => ErrorCategory::Transient,
            },
            Error::Validation { .. } => ErrorCategory::Permanent,
            Error::NotFound { .. } => ErrorCategory::Permanent,
            Error::Provision { retryable, .. } | Error::Hierarchy { retryable, .. } => {
                if *retryable {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
            Error::PartialApply { .. } => ErrorCategory::PartialFailure,
            Error::Timeout { .. } => ErrorCategory::Transient,
            Error::Authentication { .. } => ErrorCategory::Identity,
            Error::Store { fatal, .. } => {
                if *fatal {
                    ErrorCategory::Permanent
                } else {
                    ErrorCategory::Transient
                }
            }
            Error::Serialization { .. } => ErrorCategory::Permanent,
            Error::Internal { .. } => ErrorCategory::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Check if this error means the store can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Store { fatal: true, .. })
    }

    /// Get the entity associated with this error, if any
    pub fn entity(&self) -> Option<&str> {
        match self {
            Error::Validation { entity, .. } => Some(entity),
            Error::NotFound { id, .. } => Some(id),
            Error::Provision { workspace, .. } | Error::PartialApply { workspace, .. } => {
                Some(workspace)
            }
            Error::Hierarchy { project, .. } => Some(project),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization_for("yaml", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: an invalid plan is rejected up front and never retried
    ///
    /// Validation failures describe a request that can never succeed, so
    /// re-running it only delays the client seeing the problem.
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation_for_field("ws-1", "plan", "unknown plan 'gold'");
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.is_retryable());
        assert_eq!(err.entity(), Some("ws-1"));
        assert!(err.to_string().contains("unknown plan"));
    }

    /// Story: host API blips are retried, bad requests are not
    #[test]
    fn story_kube_errors_split_on_status_code() {
        assert!(api_error(503).is_retryable());
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(!api_error(403).is_retryable());
    }

    /// Story: a half-applied update is resolved by applying again
    #[test]
    fn story_partial_apply_is_retryable() {
        let err = Error::partial_apply("ws-1", "quota", "resource quota apply failed");
        assert_eq!(err.category(), ErrorCategory::PartialFailure);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("step quota"));
    }

    /// Story: identity failures fail closed and never schedule retries
    #[test]
    fn story_identity_errors_fail_closed() {
        let err = Error::authentication("user u-1 has no membership in ws-1");
        assert_eq!(err.category(), ErrorCategory::Identity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_flags_on_domain_errors() {
        assert!(Error::provision("ws", "host unavailable").is_retryable());
        assert!(!Error::provision_permanent("ws", "bad values").is_retryable());
        assert!(Error::hierarchy("team-a", "anchor not ready").is_retryable());
        assert!(!Error::hierarchy_permanent("team-a", "anchor Forbidden").is_retryable());
        assert!(Error::timeout("anchor team-a", Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_only_fatal_store_errors_are_fatal() {
        assert!(Error::store_fatal("database disk image is malformed").is_fatal());
        assert!(!Error::store("database is locked").is_fatal());
        assert!(Error::store("database is locked").is_retryable());
    }

    #[test]
    fn test_timeout_display_includes_seconds() {
        let err = Error::timeout("virtual cluster ready", Duration::from_secs(300));
        assert_eq!(err.to_string(), "timed out after 300s: virtual cluster ready");
    }
}
