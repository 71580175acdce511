//! Relational model shared by every component

mod identity;
mod project;
mod task;
mod workspace;

pub use identity::{Group, PresetRole, RoleAssignment, RoleScope, User};
pub use project::{Project, ProjectStatus};
pub use task::{Task, TaskAttempt, TaskKind, TaskOwner, TaskPayload, TaskStatus};
pub use workspace::{
    DedicatedNodeConfig, NodePlacement, NodeTaint, OidcParams, TaintEffect, Toleration,
    Workspace, WorkspaceStatus, MAX_DEDICATED_NODES,
};
