//! Hierarchical namespaces inside workspace virtual clusters
//!
//! Projects map to namespaces. Root projects are full namespaces created
//! directly; child projects are created through anchors in their parent's
//! namespace and reconciled by an in-cluster hierarchy controller, which
//! this crate also installs.

pub mod client;
pub mod controller;
pub mod handlers;
pub mod kube;
pub mod manager;

pub use client::{ClusterConnector, VirtualClusterApi};
pub use handlers::ProjectTaskHandler;
pub use crate::kube::{hierarchy_crds, KubeVirtualClusterApi};
pub use manager::{HierarchyConfig, HierarchyManager};
