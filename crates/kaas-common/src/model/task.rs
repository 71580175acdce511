//! Task model: the tagged-union payload and its bookkeeping

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workspace::{DedicatedNodeConfig, OidcParams};
use crate::naming::{project_lock_key, workspace_lock_key};
use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Discriminator of [`TaskPayload`], used as the handler table key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Provision a workspace's virtual cluster
    CreateWorkspace,
    /// Tear a workspace down
    DeleteWorkspace,
    /// Apply a plan change
    UpdatePlan,
    /// Apply a dedicated-node change
    UpdateDedicatedNodes,
    /// Install the hierarchy controller into a fresh virtual cluster
    SetupHierarchyController,
    /// Create a full (unanchored) namespace
    CreateRootProject,
    /// Create a child namespace through an anchor
    CreateProjectAnchor,
    /// Delete a project's namespace
    DeleteProjectAnchor,
    /// Re-parent a full namespace
    SetProjectParent,
    /// Apply an externally triggered event
    ExternalWebhookApply,
}

impl TaskKind {
    /// Every kind, in a stable order
    pub const ALL: [TaskKind; 10] = [
        TaskKind::CreateWorkspace,
        TaskKind::DeleteWorkspace,
        TaskKind::UpdatePlan,
        TaskKind::UpdateDedicatedNodes,
        TaskKind::SetupHierarchyController,
        TaskKind::CreateRootProject,
        TaskKind::CreateProjectAnchor,
        TaskKind::DeleteProjectAnchor,
        TaskKind::SetProjectParent,
        TaskKind::ExternalWebhookApply,
    ];

    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateWorkspace => "create-workspace",
            Self::DeleteWorkspace => "delete-workspace",
            Self::UpdatePlan => "update-plan",
            Self::UpdateDedicatedNodes => "update-dedicated-nodes",
            Self::SetupHierarchyController => "setup-hierarchy-controller",
            Self::CreateRootProject => "create-root-project",
            Self::CreateProjectAnchor => "create-project-anchor",
            Self::DeleteProjectAnchor => "delete-project-anchor",
            Self::SetProjectParent => "set-project-parent",
            Self::ExternalWebhookApply => "external-webhook-apply",
        }
    }

    /// Maximum number of attempts for this kind
    pub fn default_max_retries(&self) -> u32 {
        match self {
            Self::CreateWorkspace | Self::DeleteWorkspace | Self::SetupHierarchyController => 5,
            Self::UpdatePlan | Self::UpdateDedicatedNodes => 4,
            Self::ExternalWebhookApply => 5,
            Self::CreateRootProject
            | Self::CreateProjectAnchor
            | Self::DeleteProjectAnchor
            | Self::SetProjectParent => 3,
        }
    }

    /// Bound on a single attempt
    pub fn timeout(&self) -> Duration {
        match self {
            Self::CreateWorkspace | Self::DeleteWorkspace | Self::UpdateDedicatedNodes => {
                Duration::from_secs(15 * 60)
            }
            Self::UpdatePlan | Self::SetupHierarchyController => Duration::from_secs(10 * 60),
            Self::DeleteProjectAnchor => Duration::from_secs(5 * 60),
            Self::CreateProjectAnchor => Duration::from_secs(3 * 60),
            Self::CreateRootProject | Self::SetProjectParent => Duration::from_secs(2 * 60),
            Self::ExternalWebhookApply => Duration::from_secs(60),
        }
    }

    /// Backoff curve for this kind
    pub fn retry_config(&self) -> RetryConfig {
        let initial_delay = match self {
            Self::ExternalWebhookApply => Duration::from_secs(2),
            Self::CreateRootProject
            | Self::CreateProjectAnchor
            | Self::DeleteProjectAnchor
            | Self::SetProjectParent => Duration::from_secs(5),
            _ => Duration::from_secs(15),
        };
        RetryConfig {
            max_attempts: self.default_max_retries(),
            initial_delay,
            max_delay: Duration::from_secs(10 * 60),
            backoff_multiplier: 2.0,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::serialization_for("TaskKind", format!("unknown task kind '{s}'")))
    }
}

/// Task status
///
/// `PENDING -> IN_PROGRESS -> {COMPLETED_SUCCESS, COMPLETED_FAILURE, RETRYING}`,
/// and `RETRYING -> IN_PROGRESS` when the next attempt is claimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by a worker
    InProgress,
    /// Finished successfully
    CompletedSuccess,
    /// Finished after exhausting retries or hitting a permanent error
    CompletedFailure,
    /// Waiting for its next attempt
    Retrying,
}

impl TaskStatus {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::CompletedSuccess => "COMPLETED_SUCCESS",
            Self::CompletedFailure => "COMPLETED_FAILURE",
            Self::Retrying => "RETRYING",
        }
    }

    /// Whether the task will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompletedSuccess | Self::CompletedFailure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => Self::Pending,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED_SUCCESS" => Self::CompletedSuccess,
            "COMPLETED_FAILURE" => Self::CompletedFailure,
            "RETRYING" => Self::Retrying,
            other => {
                return Err(Error::serialization_for(
                    "TaskStatus",
                    format!("unknown task status '{other}'"),
                ))
            }
        })
    }
}

/// Operation-specific payload, tagged by kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TaskPayload {
    /// Provision a workspace
    #[serde(rename_all = "camelCase")]
    CreateWorkspace {
        /// Workspace id
        workspace_id: String,
        /// Plan name
        plan: String,
        /// Dedicated nodes, if requested
        dedicated_nodes: Option<DedicatedNodeConfig>,
        /// OIDC wiring for the virtual cluster's API server
        oidc: OidcParams,
    },
    /// Tear down a workspace
    #[serde(rename_all = "camelCase")]
    DeleteWorkspace {
        /// Workspace id
        workspace_id: String,
    },
    /// Switch plan; the node config is the one in force after the switch
    #[serde(rename_all = "camelCase")]
    UpdatePlan {
        /// Workspace id
        workspace_id: String,
        /// New plan name
        plan: String,
        /// Dedicated nodes after the switch
        dedicated_nodes: Option<DedicatedNodeConfig>,
    },
    /// Add, change or remove dedicated nodes
    #[serde(rename_all = "camelCase")]
    UpdateDedicatedNodes {
        /// Workspace id
        workspace_id: String,
        /// New dedicated-node config, `None` to release
        dedicated_nodes: Option<DedicatedNodeConfig>,
    },
    /// Install the hierarchy controller
    #[serde(rename_all = "camelCase")]
    SetupHierarchyController {
        /// Workspace id
        workspace_id: String,
    },
    /// Create a full namespace
    #[serde(rename_all = "camelCase")]
    CreateRootProject {
        /// Workspace id
        workspace_id: String,
        /// Id the project row will get
        project_id: String,
        /// Namespace name
        name: String,
    },
    /// Create a child namespace through an anchor
    #[serde(rename_all = "camelCase")]
    CreateProjectAnchor {
        /// Workspace id
        workspace_id: String,
        /// Id the project row will get
        project_id: String,
        /// Parent project id
        parent_project_id: String,
        /// Namespace (and anchor) name
        name: String,
    },
    /// Delete a project's namespace
    #[serde(rename_all = "camelCase")]
    DeleteProjectAnchor {
        /// Workspace id
        workspace_id: String,
        /// Project id
        project_id: String,
        /// Namespace name
        name: String,
    },
    /// Re-parent a full namespace
    #[serde(rename_all = "camelCase")]
    SetProjectParent {
        /// Workspace id
        workspace_id: String,
        /// Project id
        project_id: String,
        /// Namespace name
        name: String,
        /// New parent, `None` to make it a root again
        new_parent_id: Option<String>,
    },
    /// Externally triggered event
    #[serde(rename_all = "camelCase")]
    ExternalWebhookApply {
        /// Event source (e.g., "billing")
        source: String,
        /// Source-assigned event id, used for deduplication
        event_id: String,
        /// Event body
        body: serde_json::Value,
    },
}

impl TaskPayload {
    /// Discriminator
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CreateWorkspace { .. } => TaskKind::CreateWorkspace,
            Self::DeleteWorkspace { .. } => TaskKind::DeleteWorkspace,
            Self::UpdatePlan { .. } => TaskKind::UpdatePlan,
            Self::UpdateDedicatedNodes { .. } => TaskKind::UpdateDedicatedNodes,
            Self::SetupHierarchyController { .. } => TaskKind::SetupHierarchyController,
            Self::CreateRootProject { .. } => TaskKind::CreateRootProject,
            Self::CreateProjectAnchor { .. } => TaskKind::CreateProjectAnchor,
            Self::DeleteProjectAnchor { .. } => TaskKind::DeleteProjectAnchor,
            Self::SetProjectParent { .. } => TaskKind::SetProjectParent,
            Self::ExternalWebhookApply { .. } => TaskKind::ExternalWebhookApply,
        }
    }

    /// Workspace the task concerns, if any
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::CreateWorkspace { workspace_id, .. }
            | Self::DeleteWorkspace { workspace_id }
            | Self::UpdatePlan { workspace_id, .. }
            | Self::UpdateDedicatedNodes { workspace_id, .. }
            | Self::SetupHierarchyController { workspace_id }
            | Self::CreateRootProject { workspace_id, .. }
            | Self::CreateProjectAnchor { workspace_id, .. }
            | Self::DeleteProjectAnchor { workspace_id, .. }
            | Self::SetProjectParent { workspace_id, .. } => Some(workspace_id),
            Self::ExternalWebhookApply { .. } => None,
        }
    }

    /// Entity moved to ERROR when the task exhausts its retries
    pub fn owner(&self) -> TaskOwner {
        match self {
            Self::CreateWorkspace { workspace_id, .. }
            | Self::DeleteWorkspace { workspace_id }
            | Self::UpdatePlan { workspace_id, .. }
            | Self::UpdateDedicatedNodes { workspace_id, .. }
            | Self::SetupHierarchyController { workspace_id } => TaskOwner::Workspace {
                id: workspace_id.clone(),
            },
            Self::CreateRootProject {
                workspace_id,
                project_id,
                ..
            }
            | Self::CreateProjectAnchor {
                workspace_id,
                project_id,
                ..
            }
            | Self::DeleteProjectAnchor {
                workspace_id,
                project_id,
                ..
            }
            | Self::SetProjectParent {
                workspace_id,
                project_id,
                ..
            } => TaskOwner::Project {
                id: project_id.clone(),
                workspace_id: workspace_id.clone(),
            },
            Self::ExternalWebhookApply { source, .. } => TaskOwner::External {
                source: source.clone(),
            },
        }
    }

    /// Advisory lock this task must hold while executing
    ///
    /// Lifecycle tasks serialize per workspace; hierarchy tasks serialize per
    /// namespace name so creation and deletion of the same project never
    /// interleave. External events take no lock.
    pub fn lock_key(&self) -> Option<String> {
        match self {
            Self::CreateWorkspace { workspace_id, .. }
            | Self::DeleteWorkspace { workspace_id }
            | Self::UpdatePlan { workspace_id, .. }
            | Self::UpdateDedicatedNodes { workspace_id, .. }
            | Self::SetupHierarchyController { workspace_id } => {
                Some(workspace_lock_key(workspace_id))
            }
            Self::CreateRootProject {
                workspace_id, name, ..
            }
            | Self::CreateProjectAnchor {
                workspace_id, name, ..
            }
            | Self::DeleteProjectAnchor {
                workspace_id, name, ..
            }
            | Self::SetProjectParent {
                workspace_id, name, ..
            } => Some(project_lock_key(workspace_id, name)),
            Self::ExternalWebhookApply { .. } => None,
        }
    }
}

/// Entity a task acts on behalf of
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskOwner {
    /// A workspace's lifecycle
    Workspace {
        /// Workspace id
        id: String,
    },
    /// A project in a workspace
    #[serde(rename_all = "camelCase")]
    Project {
        /// Project id
        id: String,
        /// Workspace id
        workspace_id: String,
    },
    /// An external event source
    External {
        /// Source name
        source: String,
    },
}

impl TaskOwner {
    /// Short kind label ("workspace", "project", "external")
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace { .. } => "workspace",
            Self::Project { .. } => "project",
            Self::External { .. } => "external",
        }
    }

    /// Owner id
    pub fn id(&self) -> &str {
        match self {
            Self::Workspace { id } | Self::Project { id, .. } => id,
            Self::External { source } => source,
        }
    }
}

/// A durable unit of asynchronous work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task id
    pub id: String,
    /// Discriminator
    pub kind: TaskKind,
    /// Operation payload
    pub payload: TaskPayload,
    /// Status
    pub status: TaskStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Maximum number of attempts
    pub max_retries: u32,
    /// Error detail of the last failed attempt
    pub last_error: Option<String>,
    /// Result recorded on success
    pub result: Option<serde_json::Value>,
    /// Earliest time the next attempt may start
    pub available_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// New pending task with the kind's default retry budget
    pub fn new(payload: TaskPayload) -> Self {
        let now = Utc::now();
        let kind = payload.kind();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: kind.default_max_retries(),
            last_error: None,
            result: None,
            available_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Owner derived from the payload
    pub fn owner(&self) -> TaskOwner {
        self.payload.owner()
    }
}

/// One recorded execution attempt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttempt {
    /// Task id
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Outcome ("success", "failure", "deferred")
    pub outcome: String,
    /// Error detail, if the attempt failed
    pub error: Option<String>,
    /// When the attempt finished
    pub finished_at: DateTime<Utc>,
}
