//! Deterministic names for host and virtual-cluster resources
//!
//! Everything the control plane creates on the host is derived from the
//! workspace id, so a retried task always addresses the same objects.

use crate::{Error, Result};

/// Maximum length of a Kubernetes namespace / DNS-1123 label
pub const MAX_LABEL_LEN: usize = 63;

/// Prefix of every virtual-cluster instance (and its host namespace)
pub const INSTANCE_PREFIX: &str = "vc-";

/// Label key marking host nodes reserved for one workspace
pub const DEDICATED_POOL_LABEL: &str = "kaas.io/dedicated-pool";

/// Taint key repelling everything but the owning workspace's pods
pub const DEDICATED_TAINT_KEY: &str = "kaas.io/dedicated";

/// Label set on every host object the control plane owns
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value for [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kaas-control-plane";

/// Label carrying the owning workspace id
pub const WORKSPACE_LABEL: &str = "kaas.io/workspace";

/// Label recording which project a namespace belongs to
pub const PROJECT_LABEL: &str = "kaas.io/project";

/// Well-known instance type label used to match the requested node class
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// Check a string is a valid DNS-1123 label (namespace name)
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_LABEL_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// Validate a workspace id so derived names stay valid labels
pub fn validate_workspace_id(id: &str) -> Result<()> {
    let max = MAX_LABEL_LEN - INSTANCE_PREFIX.len();
    if id.len() > max || !is_dns_label(id) {
        return Err(Error::validation_for_field(
            id,
            "workspaceId",
            format!("must be a lowercase DNS label of at most {max} characters"),
        ));
    }
    Ok(())
}

/// Validate a project name (it becomes a namespace name)
pub fn validate_project_name(name: &str) -> Result<()> {
    if !is_dns_label(name) {
        return Err(Error::validation_for_field(
            name,
            "name",
            "project name must be a valid namespace name (lowercase alphanumerics and '-', max 63)",
        ));
    }
    if name.starts_with("kube-") || name == "default" || name == "hnc-system" {
        return Err(Error::validation_for_field(
            name,
            "name",
            "project name collides with a reserved namespace",
        ));
    }
    Ok(())
}

/// Virtual-cluster instance name for a workspace
pub fn instance_name(workspace_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{workspace_id}")
}

/// Host namespace holding the virtual cluster and everything it syncs down
pub fn host_namespace(workspace_id: &str) -> String {
    instance_name(workspace_id)
}

/// Host secret the virtual cluster writes its admin kubeconfig into
pub fn kubeconfig_secret_name(workspace_id: &str) -> String {
    format!("vc-{}", instance_name(workspace_id))
}

/// Key inside [`kubeconfig_secret_name`] holding the kubeconfig
pub const KUBECONFIG_SECRET_KEY: &str = "config";

/// Resource quota name applied from the plan
pub const PLAN_QUOTA_NAME: &str = "kaas-plan-quota";

/// OIDC client id (token audience) of a workspace's virtual cluster
pub fn oidc_client_id(workspace_id: &str) -> String {
    format!("kaas-{workspace_id}")
}

/// Issuer URL of a workspace's identity provider under `base_url`
pub fn issuer_url(base_url: &str, workspace_id: &str) -> String {
    format!("{}/workspaces/{workspace_id}", base_url.trim_end_matches('/'))
}

/// Advisory lock key serializing lifecycle tasks of one workspace
pub fn workspace_lock_key(workspace_id: &str) -> String {
    format!("workspace/{workspace_id}")
}

/// Advisory lock key serializing hierarchy tasks on one namespace
pub fn project_lock_key(workspace_id: &str, namespace: &str) -> String {
    format!("project/{workspace_id}/{namespace}")
}
