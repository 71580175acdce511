//! VirtualCluster resource driven on the host cluster
//!
//! The virtual-cluster runtime watches these objects and deploys a Helm
//! release per object. The control plane only writes the spec and reads the
//! phase back.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase reported once the release is deployed and the API server answers
pub const PHASE_DEPLOYED: &str = "Deployed";

/// Phase reported when the release failed to install
pub const PHASE_FAILED: &str = "Failed";

/// A virtual cluster on the host.
///
/// Example:
/// ```yaml
/// apiVersion: cluster.loft.sh/v1alpha1
/// kind: VirtualCluster
/// metadata:
///   name: vc-7f3c2d1e
///   namespace: vc-7f3c2d1e
/// spec:
///   helmRelease:
///     chart:
///       name: vcluster
///       repo: https://charts.loft.sh
///       version: 0.20.0
///     values: |
///       controlPlane: ...
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.loft.sh",
    version = "v1alpha1",
    kind = "VirtualCluster",
    namespaced,
    status = "VirtualClusterStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Helm release the runtime installs
    pub helm_release: HelmRelease,
}

/// Chart coordinates plus rendered values
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    /// Chart to install
    pub chart: HelmChart,
    /// Values document (YAML)
    #[serde(default)]
    pub values: String,
}

/// Chart coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    /// Chart name
    pub name: String,
    /// Chart repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Status reported by the virtual-cluster runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    /// Release phase (Pending, Deployed, Failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VirtualClusterStatus {
    /// Whether the virtual cluster is deployed and reachable
    pub fn is_ready(&self) -> bool {
        self.phase.as_deref() == Some(PHASE_DEPLOYED)
    }

    /// Whether the runtime gave up on this release
    pub fn is_failed(&self) -> bool {
        self.phase.as_deref() == Some(PHASE_FAILED)
    }
}
