//! Custom resources the control plane drives
//!
//! `VirtualCluster` lives on the host cluster; the hierarchy resources live
//! inside each virtual cluster.

mod hnc;
mod virtual_cluster;

pub use hnc::{
    AnchorState, HNCConfiguration, HNCConfigurationSpec, HierarchyConfiguration,
    HierarchyConfigurationSpec, HierarchyConfigurationStatus, MetaKvp, PropagatedResource,
    SubnamespaceAnchor, SubnamespaceAnchorSpec, SubnamespaceAnchorStatus, HIERARCHY_CONFIG_NAME,
    HNC_CONFIG_NAME, HNC_SYSTEM_NAMESPACE,
};
pub use virtual_cluster::{
    HelmChart, HelmRelease, VirtualCluster, VirtualClusterSpec, VirtualClusterStatus,
    PHASE_DEPLOYED, PHASE_FAILED,
};
