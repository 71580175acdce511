//! Workspace lifecycle on the shared host cluster
//!
//! A workspace is a host namespace holding one virtual cluster, a plan
//! quota and optionally a pool of reserved nodes. [`LifecycleManager`]
//! provisions, resizes and tears these down; [`WorkspaceTaskHandler`] drives
//! it from the task queue.

pub mod connector;
pub mod handlers;
pub mod host;
pub mod manager;
pub mod nodes;
pub mod values;

pub use connector::VirtualClusterConnector;
pub use handlers::WorkspaceTaskHandler;
pub use host::{HostClusterApi, KubeHostClusterApi};
pub use manager::{LifecycleConfig, LifecycleManager, LifecycleStep, ResourceChange};
