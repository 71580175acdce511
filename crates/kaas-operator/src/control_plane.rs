//! Entry points the request layer calls
//!
//! Every submission is validated before it becomes a task: permanent
//! configuration errors are returned to the caller and never enqueued.
//! Reads go straight to the store.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use kaas_cluster::connector::internal_server_url;
use kaas_cluster::LifecycleManager;
use kaas_common::kube_utils::kubeconfig_ca_data;
use kaas_common::model::{
    Group, Project, Task, TaskAttempt, TaskKind, TaskPayload, Workspace, WorkspaceStatus,
};
use kaas_common::naming::validate_workspace_id;
use kaas_common::{Error, Result};
use kaas_hierarchy::HierarchyManager;
use kaas_identity::{generate_kubeconfig, ClusterEndpoint, IdentityProvider};
use kaas_store::{Store, TaskFilter};
use kaas_tasks::TaskQueue;

/// Page size for task listings that set no limit
pub const DEFAULT_TASK_PAGE: usize = 50;

/// A task plus its attempt log
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    /// The task row
    pub task: Task,
    /// Every attempt so far, oldest first
    pub attempts: Vec<TaskAttempt>,
}

/// The control plane facade
#[derive(Clone)]
pub struct ControlPlane {
    store: Store,
    queue: TaskQueue,
    lifecycle: Arc<LifecycleManager>,
    hierarchy: Arc<HierarchyManager>,
    identity: Arc<IdentityProvider>,
}

impl ControlPlane {
    /// Assemble the facade
    pub fn new(
        queue: TaskQueue,
        lifecycle: Arc<LifecycleManager>,
        hierarchy: Arc<HierarchyManager>,
        identity: Arc<IdentityProvider>,
    ) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            lifecycle,
            hierarchy,
            identity,
        }
    }

    /// The task queue submissions go to
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Validate and enqueue a task. Returns the task id.
    ///
    /// A create records the PENDING_CREATION workspace row and its task in
    /// one transaction.
    pub fn submit_task(&self, payload: TaskPayload) -> Result<String> {
        let task = Task::new(self.prepare(payload)?);
        if let TaskPayload::CreateWorkspace {
            ref workspace_id,
            ref plan,
            ref dedicated_nodes,
            ..
        } = task.payload
        {
            let row = Workspace::pending(
                workspace_id.as_str(),
                plan.as_str(),
                dedicated_nodes.clone(),
            );
            if !self.queue.enqueue_with_workspace(&row, &task)? {
                return Err(already_exists(workspace_id));
            }
        } else {
            self.queue.enqueue_task(&task)?;
        }
        Ok(task.id)
    }

    fn prepare(&self, payload: TaskPayload) -> Result<TaskPayload> {
        match payload {
            TaskPayload::CreateWorkspace {
                workspace_id,
                plan,
                dedicated_nodes,
                ..
            } => {
                validate_workspace_id(&workspace_id)?;
                self.lifecycle
                    .validate_resources(&workspace_id, &plan, dedicated_nodes.as_ref())?;
                if self.store.get_workspace(&workspace_id)?.is_some() {
                    return Err(already_exists(&workspace_id));
                }
                let oidc = self.lifecycle.oidc_params(&workspace_id);
                Ok(TaskPayload::CreateWorkspace {
                    workspace_id,
                    plan,
                    dedicated_nodes,
                    oidc,
                })
            }
            TaskPayload::DeleteWorkspace { ref workspace_id } => {
                self.get_workspace(workspace_id)?;
                Ok(payload)
            }
            TaskPayload::UpdatePlan {
                workspace_id,
                plan,
                dedicated_nodes,
            } => {
                self.mutable_workspace(&workspace_id)?;
                let target = self.lifecycle.plans().get(&plan)?;
                let dedicated_nodes = match dedicated_nodes {
                    Some(_) if !target.dedicated_nodes_allowed => {
                        info!(
                            workspace = %workspace_id,
                            plan = %plan,
                            "plan has no dedicated nodes; releasing the workspace's reservation"
                        );
                        None
                    }
                    other => other,
                };
                self.lifecycle
                    .validate_resources(&workspace_id, &plan, dedicated_nodes.as_ref())?;
                Ok(TaskPayload::UpdatePlan {
                    workspace_id,
                    plan,
                    dedicated_nodes,
                })
            }
            TaskPayload::UpdateDedicatedNodes {
                ref workspace_id,
                ref dedicated_nodes,
            } => {
                let ws = self.mutable_workspace(workspace_id)?;
                self.lifecycle
                    .validate_resources(workspace_id, &ws.plan, dedicated_nodes.as_ref())?;
                Ok(payload)
            }
            TaskPayload::SetupHierarchyController { ref workspace_id } => {
                self.mutable_workspace(workspace_id)?;
                Ok(payload)
            }
            TaskPayload::CreateRootProject {
                ref workspace_id,
                ref name,
                ..
            } => {
                self.mutable_workspace(workspace_id)?;
                self.hierarchy.check_create_root(workspace_id, name)?;
                Ok(payload)
            }
            TaskPayload::CreateProjectAnchor {
                ref workspace_id,
                ref parent_project_id,
                ref name,
                ..
            } => {
                self.mutable_workspace(workspace_id)?;
                self.hierarchy
                    .check_create_child(workspace_id, parent_project_id, name)?;
                Ok(payload)
            }
            TaskPayload::DeleteProjectAnchor { ref project_id, .. } => {
                self.hierarchy.check_delete(project_id)?;
                Ok(payload)
            }
            TaskPayload::SetProjectParent {
                ref project_id,
                ref new_parent_id,
                ..
            } => {
                self.hierarchy
                    .check_set_parent(project_id, new_parent_id.as_deref())?;
                Ok(payload)
            }
            TaskPayload::ExternalWebhookApply {
                ref source,
                ref event_id,
                ..
            } => {
                if source.is_empty() || event_id.is_empty() {
                    return Err(Error::validation(
                        "external events need a source and an event id",
                    ));
                }
                Ok(payload)
            }
        }
    }

    /// A workspace that may still accept changes
    fn mutable_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let ws = self.get_workspace(workspace_id)?;
        match ws.status {
            WorkspaceStatus::Deleting | WorkspaceStatus::Error => Err(Error::validation_for(
                workspace_id,
                format!("workspace {workspace_id} is {}", ws.status),
            )),
            _ => Ok(ws),
        }
    }

    /// Fetch a workspace
    pub fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.store
            .get_workspace(workspace_id)?
            .ok_or_else(|| Error::not_found("workspace", workspace_id))
    }

    /// Fetch a project
    pub fn get_project(&self, project_id: &str) -> Result<Project> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("project", project_id))
    }

    /// Fetch a task and its attempts
    pub fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        let attempts = self.store.task_attempts(task_id)?;
        Ok(TaskStatusView { task, attempts })
    }

    /// Tasks matching `filter`, newest first. Pages hold
    /// [`DEFAULT_TASK_PAGE`] tasks unless the filter sets a limit.
    pub fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            limit: Some(filter.limit.unwrap_or(DEFAULT_TASK_PAGE)),
            ..filter
        };
        Ok(self.store.list_tasks(&filter)?)
    }

    /// Requeue a task that finished as failed.
    ///
    /// A workspace in ERROR or DELETING only accepts its delete, so other
    /// tasks scoped to one are refused.
    pub fn retry_task(&self, task_id: &str) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if let Some(workspace_id) = task.payload.workspace_id() {
            if task.kind == TaskKind::DeleteWorkspace {
                self.get_workspace(workspace_id)?;
            } else {
                self.mutable_workspace(workspace_id)?;
            }
        }
        let task = self.store.retry_task(task_id, Utc::now())?;
        self.queue.wake();
        info!(task_id = %task.id, kind = %task.kind, "failed task requeued");
        Ok(task)
    }

    /// Issue a token for `user_id` and package it as a kubeconfig for the
    /// workspace's virtual cluster.
    pub async fn generate_kubeconfig(&self, workspace_id: &str, user_id: &str) -> Result<String> {
        let ws = self.get_workspace(workspace_id)?;
        if !ws.status.is_serving() {
            return Err(Error::validation_for(
                workspace_id,
                format!("workspace {workspace_id} is {}", ws.status),
            ));
        }
        let host_kubeconfig = self.lifecycle.get_host_kubeconfig(workspace_id).await?;
        let endpoint = ClusterEndpoint {
            server: self
                .lifecycle
                .external_host(&ws)
                .map(|host| format!("https://{host}"))
                .unwrap_or_else(|| internal_server_url(workspace_id)),
            ca_data: kubeconfig_ca_data(&host_kubeconfig)?,
        };
        generate_kubeconfig(&self.identity, user_id, workspace_id, &endpoint)
    }

    /// Move a group under a new parent (or make it a root).
    ///
    /// The parent must be in the same workspace and the move must not
    /// create a cycle; both are checked in the transaction that writes it.
    pub fn reparent_group(&self, group_id: &str, new_parent: Option<&str>) -> Result<Group> {
        self.store.reparent_group(group_id, new_parent)?;
        info!(group = %group_id, parent = ?new_parent, "group re-parented");
        self.store
            .get_group(group_id)?
            .ok_or_else(|| Error::not_found("group", group_id))
    }
}

fn already_exists(workspace_id: &str) -> Error {
    Error::validation_for(
        workspace_id,
        format!("workspace {workspace_id} already exists"),
    )
}
