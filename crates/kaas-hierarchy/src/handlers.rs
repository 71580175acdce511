//! Task handlers for project operations

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use kaas_common::model::{Project, Task, TaskPayload, WorkspaceStatus};
use kaas_common::{Error, Result};
use kaas_tasks::{Outcome, TaskHandler};

use crate::manager::HierarchyManager;

/// Delay before retrying a project task whose workspace is still coming up
pub const WORKSPACE_NOT_READY_DELAY: Duration = Duration::from_secs(15);

/// Handles create-root-project, create-project-anchor, delete-project-anchor
/// and set-project-parent tasks.
pub struct ProjectTaskHandler {
    manager: Arc<HierarchyManager>,
    not_ready_delay: Duration,
}

enum Gate {
    Proceed,
    Defer(String),
    Gone,
}

impl ProjectTaskHandler {
    /// Handler driving `manager`
    pub fn new(manager: Arc<HierarchyManager>) -> Self {
        Self {
            manager,
            not_ready_delay: WORKSPACE_NOT_READY_DELAY,
        }
    }

    /// Override the not-ready deferral delay
    pub fn with_not_ready_delay(mut self, delay: Duration) -> Self {
        self.not_ready_delay = delay;
        self
    }

    /// Creations and re-parenting need a serving virtual cluster; deletions
    /// also run while the workspace is being torn down or is in ERROR, since
    /// teardown waits for them.
    fn gate(&self, workspace_id: &str, deletion: bool) -> Result<Gate> {
        let Some(ws) = self.manager.store().get_workspace(workspace_id)? else {
            if deletion {
                return Ok(Gate::Gone);
            }
            return Err(Error::not_found("workspace", workspace_id));
        };
        match ws.status {
            s if s.is_serving() => Ok(Gate::Proceed),
            WorkspaceStatus::PendingCreation | WorkspaceStatus::ConfiguringHierarchyController => {
                Ok(Gate::Defer(format!("workspace {workspace_id} is {}", ws.status)))
            }
            WorkspaceStatus::Deleting | WorkspaceStatus::Error if deletion => Ok(Gate::Proceed),
            status => Err(Error::validation_for(
                workspace_id,
                format!("workspace {workspace_id} is {status}"),
            )),
        }
    }
}

#[async_trait]
impl TaskHandler for ProjectTaskHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        let workspace_id = task.payload.workspace_id().unwrap_or_default();
        let deletion = matches!(task.payload, TaskPayload::DeleteProjectAnchor { .. });
        match self.gate(workspace_id, deletion)? {
            Gate::Proceed => {}
            Gate::Defer(reason) => {
                debug!(task = %task.id, %reason, "deferring project task");
                return Ok(Outcome::defer(self.not_ready_delay, reason));
            }
            Gate::Gone => {
                info!(task = %task.id, workspace = %workspace_id, "workspace gone, nothing to delete");
                return Ok(Outcome::with_result(json!({ "deleted": false })));
            }
        }

        match &task.payload {
            TaskPayload::CreateRootProject {
                workspace_id,
                project_id,
                name,
            } => {
                let project = self
                    .manager
                    .create_root_project(workspace_id, project_id, name)
                    .await?;
                Ok(Outcome::with_result(json!({ "projectId": project.id })))
            }
            TaskPayload::CreateProjectAnchor {
                workspace_id,
                project_id,
                parent_project_id,
                name,
            } => {
                let project = self
                    .manager
                    .create_child_project(workspace_id, project_id, parent_project_id, name)
                    .await?;
                Ok(Outcome::with_result(json!({ "projectId": project.id })))
            }
            TaskPayload::DeleteProjectAnchor { project_id, .. } => {
                let deleted = self.manager.delete_project(project_id).await?;
                Ok(Outcome::with_result(json!({ "deleted": deleted })))
            }
            TaskPayload::SetProjectParent {
                project_id,
                new_parent_id,
                ..
            } => {
                self.manager
                    .set_project_parent(project_id, new_parent_id.as_deref())
                    .await?;
                Ok(Outcome::done())
            }
            other => Err(Error::validation_for(
                task.id.clone(),
                format!("{} payload routed to the project handler", other.kind()),
            )),
        }
    }

    async fn on_exhausted(&self, task: &Task, error: &Error) -> Result<()> {
        let project = match &task.payload {
            TaskPayload::CreateRootProject {
                workspace_id,
                project_id,
                name,
            } => Project::root(project_id, workspace_id, name),
            TaskPayload::CreateProjectAnchor {
                workspace_id,
                project_id,
                parent_project_id,
                name,
            } => Project::anchored(project_id, workspace_id, name, parent_project_id),
            _ => return Ok(()),
        };
        if self.manager.store().get_workspace(&project.workspace_id)?.is_none() {
            return Ok(());
        }
        self.manager
            .record_failed_creation(project, &error.to_string())
    }
}
