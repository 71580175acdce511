//! Hierarchical namespace controller resources
//!
//! Only the fields the control plane reads or writes are modelled; the
//! controller itself owns the rest.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the per-namespace hierarchy configuration object
pub const HIERARCHY_CONFIG_NAME: &str = "hierarchy";

/// Name of the cluster-wide controller configuration object
pub const HNC_CONFIG_NAME: &str = "config";

/// Namespace the controller runs in
pub const HNC_SYSTEM_NAMESPACE: &str = "hnc-system";

/// Anchor that asks the controller to create a child namespace.
///
/// The anchor lives in the parent namespace and carries the child's name.
/// Deleting the anchor deletes the child namespace.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "SubnamespaceAnchor",
    namespaced,
    status = "SubnamespaceAnchorStatus",
    shortname = "subns",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorSpec {
    /// Labels propagated onto the child namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<MetaKvp>,
    /// Annotations propagated onto the child namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<MetaKvp>,
}

/// Key/value pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MetaKvp {
    /// Key
    pub key: String,
    /// Value
    pub value: String,
}

/// Anchor status as reported by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SubnamespaceAnchorStatus {
    /// One of Ok, Missing, Conflict, Forbidden
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Interpreted anchor state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnchorState {
    /// Child namespace exists and is owned by the anchor
    Ok,
    /// Controller has not materialized the namespace yet
    Missing,
    /// A namespace with that name exists and is not owned by the anchor
    Conflict,
    /// Anchors are not allowed in the parent namespace
    Forbidden,
    /// No status reported yet
    Pending,
}

impl AnchorState {
    /// Whether waiting longer cannot help
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, Self::Conflict | Self::Forbidden)
    }
}

impl fmt::Display for AnchorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "Ok",
            Self::Missing => "Missing",
            Self::Conflict => "Conflict",
            Self::Forbidden => "Forbidden",
            Self::Pending => "Pending",
        };
        f.write_str(s)
    }
}

impl SubnamespaceAnchor {
    /// Interpret the reported status
    pub fn state(&self) -> AnchorState {
        match self.status.as_ref().and_then(|s| s.status.as_deref()) {
            Some("Ok") => AnchorState::Ok,
            Some("Missing") => AnchorState::Missing,
            Some("Conflict") => AnchorState::Conflict,
            Some("Forbidden") => AnchorState::Forbidden,
            _ => AnchorState::Pending,
        }
    }
}

/// Per-namespace hierarchy settings (object name is always `hierarchy`)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "HierarchyConfiguration",
    namespaced,
    status = "HierarchyConfigurationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationSpec {
    /// Parent namespace of a full namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Whether deleting this namespace may cascade to subnamespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_cascading_deletion: Option<bool>,
}

/// Hierarchy status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HierarchyConfigurationStatus {
    /// Child namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// Cluster-wide controller configuration (object name is always `config`)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "hnc.x-k8s.io", version = "v1alpha2", kind = "HNCConfiguration")]
#[serde(rename_all = "camelCase")]
pub struct HNCConfigurationSpec {
    /// Resource types and how they propagate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<PropagatedResource>,
}

/// Propagation setting for one resource type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PropagatedResource {
    /// API group ("" for core)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// Propagate, Ignore, Remove or AllowPropagate
    pub mode: String,
}

impl PropagatedResource {
    /// Resource copied from parent namespaces into every descendant
    pub fn propagate(group: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            mode: "Propagate".to_string(),
        }
    }
}
