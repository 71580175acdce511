//! Virtual-cluster access used by the hierarchy manager
//!
//! The manager only talks to a workspace's virtual cluster through these
//! traits, so tests drive it with mocks and production code plugs in the
//! kube-backed implementation from [`crate::kube`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use kaas_common::crd::{HNCConfigurationSpec, SubnamespaceAnchor};
use kaas_common::Result;

/// Operations on one workspace's virtual cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtualClusterApi: Send + Sync {
    /// Apply the hierarchy controller's CRDs
    async fn apply_crds(&self) -> Result<()>;

    /// Create or update a namespace with the given labels
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Whether a namespace exists (terminating counts as existing)
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Delete a namespace; returns whether a delete was issued
    async fn delete_namespace(&self, name: &str) -> Result<bool>;

    /// Apply the controller's service account, RBAC and deployment
    async fn apply_controller(&self, image: &str) -> Result<()>;

    /// Whether the controller deployment has a ready replica
    async fn controller_ready(&self) -> Result<bool>;

    /// Apply the cluster-wide controller configuration
    async fn apply_controller_config(&self, spec: &HNCConfigurationSpec) -> Result<()>;

    /// Create or update the anchor `name` in `parent_namespace`
    async fn apply_anchor(&self, parent_namespace: &str, name: &str) -> Result<()>;

    /// Read the anchor `name` in `parent_namespace`
    async fn get_anchor(&self, parent_namespace: &str, name: &str)
        -> Result<Option<SubnamespaceAnchor>>;

    /// Delete the anchor `name` in `parent_namespace`; returns whether a delete was issued
    async fn delete_anchor(&self, parent_namespace: &str, name: &str) -> Result<bool>;

    /// Names of the anchors in a namespace
    async fn list_anchors(&self, namespace: &str) -> Result<Vec<String>>;

    /// Set the parent of a full namespace (`None` makes it a root)
    async fn set_parent(&self, namespace: &str, parent: Option<String>) -> Result<()>;
}

/// Resolves a workspace id to a client for its virtual cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the workspace's virtual cluster
    async fn connect(&self, workspace_id: &str) -> Result<Arc<dyn VirtualClusterApi>>;
}
