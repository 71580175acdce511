//! Task handlers for workspace lifecycle operations

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use kaas_common::model::{Task, TaskKind, TaskPayload, WorkspaceStatus};
use kaas_common::{Error, Result};
use kaas_tasks::{Outcome, TaskHandler, TaskQueue};

use crate::manager::{LifecycleManager, LifecycleStep, ResourceChange};

/// Delay before retrying a lifecycle task that is waiting on other work
pub const LIFECYCLE_WAIT_DELAY: Duration = Duration::from_secs(10);

/// Handles create, delete, update and hierarchy-setup tasks for workspaces.
pub struct WorkspaceTaskHandler {
    manager: Arc<LifecycleManager>,
    queue: TaskQueue,
    wait_delay: Duration,
}

impl WorkspaceTaskHandler {
    /// Handler driving `manager`; follow-up tasks go to `queue`
    pub fn new(manager: Arc<LifecycleManager>, queue: TaskQueue) -> Self {
        Self {
            manager,
            queue,
            wait_delay: LIFECYCLE_WAIT_DELAY,
        }
    }

    /// Override the wait deferral delay
    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    /// Queue hierarchy setup for a workspace that has just been provisioned,
    /// unless one is already pending.
    fn ensure_setup_queued(&self, workspace_id: &str) -> Result<()> {
        let Some(ws) = self.manager.store().get_workspace(workspace_id)? else {
            return Ok(());
        };
        if ws.status != WorkspaceStatus::ConfiguringHierarchyController {
            return Ok(());
        }
        let pending = self
            .manager
            .store()
            .count_active_tasks(workspace_id, TaskKind::SetupHierarchyController)?;
        if pending == 0 {
            self.queue.enqueue(TaskPayload::SetupHierarchyController {
                workspace_id: workspace_id.to_string(),
            })?;
        }
        Ok(())
    }

    fn outcome(&self, task: &Task, step: LifecycleStep) -> Outcome {
        match step {
            LifecycleStep::Applied(ws) => Outcome::with_result(json!({
                "workspaceId": ws.id,
                "status": ws.status.as_str(),
                "plan": ws.plan,
                "instanceName": ws.instance_name,
            })),
            LifecycleStep::Removed => Outcome::with_result(json!({ "deleted": true })),
            LifecycleStep::Skipped(reason) => {
                info!(task = %task.id, %reason, "nothing to do");
                Outcome::with_result(json!({ "skipped": reason }))
            }
            LifecycleStep::Waiting(reason) => {
                debug!(task = %task.id, %reason, "deferring lifecycle task");
                Outcome::defer(self.wait_delay, reason)
            }
        }
    }
}

#[async_trait]
impl TaskHandler for WorkspaceTaskHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        let step = match &task.payload {
            TaskPayload::CreateWorkspace {
                workspace_id,
                plan,
                dedicated_nodes,
                oidc,
            } => {
                let step = self
                    .manager
                    .provision(workspace_id, plan, dedicated_nodes.as_ref(), oidc)
                    .await?;
                self.ensure_setup_queued(workspace_id)?;
                step
            }
            TaskPayload::SetupHierarchyController { workspace_id } => {
                self.manager.setup_hierarchy(workspace_id).await?
            }
            TaskPayload::UpdatePlan {
                workspace_id,
                plan,
                dedicated_nodes,
            } => {
                let change = ResourceChange {
                    plan: Some(plan.clone()),
                    dedicated_nodes: dedicated_nodes.clone(),
                };
                self.manager.update_resources(workspace_id, &change).await?
            }
            TaskPayload::UpdateDedicatedNodes {
                workspace_id,
                dedicated_nodes,
            } => {
                let change = ResourceChange {
                    plan: None,
                    dedicated_nodes: dedicated_nodes.clone(),
                };
                self.manager.update_resources(workspace_id, &change).await?
            }
            TaskPayload::DeleteWorkspace { workspace_id } => {
                self.manager.deprovision(workspace_id).await?
            }
            other => {
                return Err(Error::validation_for(
                    task.id.clone(),
                    format!("{} payload routed to the workspace handler", other.kind()),
                ))
            }
        };
        Ok(self.outcome(task, step))
    }

    async fn on_exhausted(&self, task: &Task, _error: &Error) -> Result<()> {
        match &task.payload {
            TaskPayload::CreateWorkspace { workspace_id, .. }
            | TaskPayload::SetupHierarchyController { workspace_id } => {
                self.manager.record_partial_provision(workspace_id).await
            }
            _ => Ok(()),
        }
    }
}
