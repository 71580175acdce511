//! Workspace model and its lifecycle state machine

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::naming::{self, DEDICATED_POOL_LABEL, DEDICATED_TAINT_KEY, INSTANCE_TYPE_LABEL};
use crate::{Error, Result};

/// Upper bound on dedicated nodes a single workspace may reserve
pub const MAX_DEDICATED_NODES: u32 = 32;

/// Lifecycle status of a workspace's virtual cluster
///
/// ```text
/// PENDING_CREATION -> CONFIGURING_HIERARCHY_CONTROLLER -> RUNNING
/// RUNNING <-> UPDATING_PLAN | UPDATING_NODES
/// any non-terminal -> DELETING -> (row removed)
/// any non-terminal -> ERROR -> DELETING
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Row written, create task queued
    PendingCreation,
    /// Virtual cluster is up, hierarchy controller being installed
    ConfiguringHierarchyController,
    /// Serving traffic
    Running,
    /// Plan change being applied
    UpdatingPlan,
    /// Dedicated node change being applied
    UpdatingNodes,
    /// Teardown started; all other work no-ops
    Deleting,
    /// A task exhausted its retries
    Error,
}

impl WorkspaceStatus {
    /// Stable string form used in the store and read models
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingCreation => "PENDING_CREATION",
            Self::ConfiguringHierarchyController => "CONFIGURING_HIERARCHY_CONTROLLER",
            Self::Running => "RUNNING",
            Self::UpdatingPlan => "UPDATING_PLAN",
            Self::UpdatingNodes => "UPDATING_NODES",
            Self::Deleting => "DELETING",
            Self::Error => "ERROR",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Staying in the same state is allowed so a redelivered task can resume.
    pub fn can_transition_to(self, next: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Deleting, Error) => true,
            (Deleting, _) => false,
            (_, Error) | (_, Deleting) => true,
            (PendingCreation, ConfiguringHierarchyController) => true,
            (ConfiguringHierarchyController, Running) => true,
            (Running, UpdatingPlan) | (Running, UpdatingNodes) => true,
            (UpdatingPlan, Running) | (UpdatingNodes, Running) => true,
            _ => false,
        }
    }

    /// Whether the virtual cluster is serving and its instance name is set
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Running | Self::UpdatingPlan | Self::UpdatingNodes)
    }

    /// Whether the workspace is in the middle of an update
    pub fn is_updating(self) -> bool {
        matches!(self, Self::UpdatingPlan | Self::UpdatingNodes)
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING_CREATION" => Self::PendingCreation,
            "CONFIGURING_HIERARCHY_CONTROLLER" => Self::ConfiguringHierarchyController,
            "RUNNING" => Self::Running,
            "UPDATING_PLAN" => Self::UpdatingPlan,
            "UPDATING_NODES" => Self::UpdatingNodes,
            "DELETING" => Self::Deleting,
            "ERROR" => Self::Error,
            other => {
                return Err(Error::serialization_for(
                    "WorkspaceStatus",
                    format!("unknown workspace status '{other}'"),
                ))
            }
        })
    }
}

/// Taint effect, mirroring the Kubernetes enum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// Pods without a toleration are not scheduled
    NoSchedule,
    /// Scheduler avoids the node when it can
    PreferNoSchedule,
    /// Running pods without a toleration are evicted
    NoExecute,
}

impl TaintEffect {
    /// Kubernetes string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        }
    }
}

/// Extra taint placed on the reserved nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTaint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect
    pub effect: TaintEffect,
}

/// Dedicated host nodes requested for a workspace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedNodeConfig {
    /// Number of host nodes to reserve
    pub count: u32,
    /// Host instance class (matched against the instance-type label)
    pub instance_class: String,
    /// Additional labels the reserved nodes must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Additional taints to place on the reserved nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaint>,
}

impl DedicatedNodeConfig {
    /// Reject malformed node configs before anything is enqueued
    pub fn validate(&self, workspace_id: &str) -> Result<()> {
        if self.count == 0 || self.count > MAX_DEDICATED_NODES {
            return Err(Error::validation_for_field(
                workspace_id,
                "dedicatedNodes.count",
                format!("count must be between 1 and {MAX_DEDICATED_NODES}"),
            ));
        }
        if self.instance_class.trim().is_empty() {
            return Err(Error::validation_for_field(
                workspace_id,
                "dedicatedNodes.instanceClass",
                "instance class is required",
            ));
        }
        for key in self.node_selector.keys() {
            if key.is_empty() || key == DEDICATED_POOL_LABEL || key == INSTANCE_TYPE_LABEL {
                return Err(Error::validation_for_field(
                    workspace_id,
                    "dedicatedNodes.nodeSelector",
                    format!("selector key '{key}' is reserved or empty"),
                ));
            }
        }
        for taint in &self.taints {
            if taint.key.is_empty() || taint.key == DEDICATED_TAINT_KEY {
                return Err(Error::validation_for_field(
                    workspace_id,
                    "dedicatedNodes.taints",
                    format!("taint key '{}' is reserved or empty", taint.key),
                ));
            }
        }
        Ok(())
    }
}

/// Toleration in Kubernetes shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key tolerated
    pub key: String,
    /// "Equal" or "Exists"
    pub operator: String,
    /// Taint value (for "Equal")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Effect tolerated
    pub effect: String,
}

/// Where a workspace's pods are allowed to land
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    /// Labels a node must carry
    pub node_selector: BTreeMap<String, String>,
    /// Taints the pods tolerate
    pub tolerations: Vec<Toleration>,
}

impl NodePlacement {
    /// Placement pinning a workspace to its reserved pool
    ///
    /// The selector always contains the reserved-pool label and the
    /// tolerations always contain the reserved-pool taint, so pods only run on
    /// nodes reserved for this workspace.
    pub fn dedicated(workspace_id: &str, config: &DedicatedNodeConfig) -> Self {
        let mut node_selector = config.node_selector.clone();
        node_selector.insert(DEDICATED_POOL_LABEL.to_string(), workspace_id.to_string());
        node_selector.insert(
            INSTANCE_TYPE_LABEL.to_string(),
            config.instance_class.clone(),
        );

        let mut tolerations = vec![Toleration {
            key: DEDICATED_TAINT_KEY.to_string(),
            operator: "Equal".to_string(),
            value: Some(workspace_id.to_string()),
            effect: TaintEffect::NoSchedule.as_str().to_string(),
        }];
        tolerations.extend(config.taints.iter().map(|t| Toleration {
            key: t.key.clone(),
            operator: if t.value.is_some() { "Equal" } else { "Exists" }.to_string(),
            value: t.value.clone(),
            effect: t.effect.as_str().to_string(),
        }));

        Self {
            node_selector,
            tolerations,
        }
    }

    /// Whether this placement restricts scheduling at all
    pub fn is_shared(&self) -> bool {
        self.node_selector.is_empty() && self.tolerations.is_empty()
    }
}

/// OIDC settings wired into a virtual cluster's API server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcParams {
    /// Issuer URL, unique per workspace
    pub issuer_url: String,
    /// Client id, which is also the token audience
    pub client_id: String,
    /// Claim used as the Kubernetes username
    pub username_claim: String,
    /// Claim carrying group names
    pub groups_claim: String,
    /// Prefix applied to usernames ("-" disables prefixing)
    pub username_prefix: String,
    /// Prefix applied to group names
    pub groups_prefix: String,
}

impl OidcParams {
    /// Default claim mapping for a given issuer and client
    pub fn new(issuer_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer_url: issuer_url.into(),
            client_id: client_id.into(),
            username_claim: "sub".to_string(),
            groups_claim: "groups".to_string(),
            username_prefix: "oidc:".to_string(),
            groups_prefix: "oidc:".to_string(),
        }
    }

    /// kube-apiserver flags for this configuration
    pub fn api_server_args(&self) -> Vec<String> {
        vec![
            format!("--oidc-issuer-url={}", self.issuer_url),
            format!("--oidc-client-id={}", self.client_id),
            format!("--oidc-username-claim={}", self.username_claim),
            format!("--oidc-groups-claim={}", self.groups_claim),
            format!("--oidc-username-prefix={}", self.username_prefix),
            format!("--oidc-groups-prefix={}", self.groups_prefix),
            "--oidc-signing-algs=ES256".to_string(),
        ]
    }
}

/// A tenant workspace and its virtual cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Workspace id
    pub id: String,
    /// Plan name
    pub plan: String,
    /// Lifecycle status
    pub status: WorkspaceStatus,
    /// Dedicated nodes, if any
    pub dedicated_nodes: Option<DedicatedNodeConfig>,
    /// Virtual-cluster instance name, set once provisioned
    pub instance_name: Option<String>,
    /// Last error recorded against the workspace
    pub last_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// New workspace awaiting its create task
    pub fn pending(
        id: impl Into<String>,
        plan: impl Into<String>,
        dedicated_nodes: Option<DedicatedNodeConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan: plan.into(),
            status: WorkspaceStatus::PendingCreation,
            dedicated_nodes,
            instance_name: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current pod placement derived from the dedicated-node config
    pub fn placement(&self) -> NodePlacement {
        match &self.dedicated_nodes {
            Some(config) => NodePlacement::dedicated(&self.id, config),
            None => NodePlacement::default(),
        }
    }

    /// Node selector applied to the workspace's pods, empty when shared
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        self.placement().node_selector
    }

    /// Deterministic instance name for this workspace
    pub fn expected_instance_name(&self) -> String {
        naming::instance_name(&self.id)
    }
}
