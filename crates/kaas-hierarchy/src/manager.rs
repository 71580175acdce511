//! Project hierarchy inside a workspace's virtual cluster
//!
//! Child projects are created through anchors in the parent's namespace and
//! only written to the store once the controller reports the anchor `Ok`.
//! Deletions go through the anchor as well; the namespace itself is only
//! deleted directly for root projects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use kaas_common::crd::{AnchorState, PropagatedResource, HNC_SYSTEM_NAMESPACE};
use kaas_common::kube_utils::{poll_until, DEFAULT_POLL_INTERVAL};
use kaas_common::model::{Project, ProjectStatus, TaskKind};
use kaas_common::naming::{
    validate_project_name, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PROJECT_LABEL, WORKSPACE_LABEL,
};
use kaas_common::{Error, Result};
use kaas_store::{Store, StoreError};

use crate::client::{ClusterConnector, VirtualClusterApi};
use crate::controller::{controller_config, DEFAULT_CONTROLLER_IMAGE};

/// Hierarchy manager settings
#[derive(Clone, Debug)]
pub struct HierarchyConfig {
    /// Controller image installed into each virtual cluster
    pub controller_image: String,
    /// Resources propagated in addition to RBAC
    pub extra_propagated: Vec<PropagatedResource>,
    /// Bound on waiting for the controller to become ready
    pub controller_ready_timeout: Duration,
    /// Bound on waiting for an anchor to report `Ok`
    pub anchor_timeout: Duration,
    /// Bound on waiting for a namespace to disappear
    pub namespace_delete_timeout: Duration,
    /// Interval between status polls
    pub poll_interval: Duration,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            controller_image: DEFAULT_CONTROLLER_IMAGE.to_string(),
            extra_propagated: Vec::new(),
            controller_ready_timeout: Duration::from_secs(5 * 60),
            anchor_timeout: Duration::from_secs(2 * 60),
            namespace_delete_timeout: Duration::from_secs(4 * 60),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Hierarchical namespace manager
pub struct HierarchyManager {
    store: Store,
    connector: Arc<dyn ClusterConnector>,
    config: HierarchyConfig,
}

impl HierarchyManager {
    /// Manager reading projects from `store` and reaching clusters via `connector`
    pub fn new(store: Store, connector: Arc<dyn ClusterConnector>, config: HierarchyConfig) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    /// The relational store
    pub fn store(&self) -> &Store {
        &self.store
    }

    fn namespace_labels(workspace_id: &str, project_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (WORKSPACE_LABEL.to_string(), workspace_id.to_string()),
            (PROJECT_LABEL.to_string(), project_id.to_string()),
        ])
    }

    /// Install the controller, its CRDs and propagation config (idempotent).
    ///
    /// Existing anchors are untouched; re-running only re-applies the same
    /// objects.
    pub async fn install_controller(&self, workspace_id: &str) -> Result<()> {
        let vc = self.connector.connect(workspace_id).await?;
        vc.apply_crds().await?;
        vc.ensure_namespace(
            HNC_SYSTEM_NAMESPACE,
            &BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]),
        )
        .await?;
        vc.apply_controller(&self.config.controller_image).await?;

        let check = Arc::clone(&vc);
        poll_until(
            self.config.controller_ready_timeout,
            self.config.poll_interval,
            format!("hierarchy controller in {workspace_id}"),
            move || {
                let vc = Arc::clone(&check);
                async move { vc.controller_ready().await }
            },
        )
        .await?;

        vc.apply_controller_config(&controller_config(&self.config.extra_propagated))
            .await?;
        info!(workspace = %workspace_id, "hierarchy controller installed");
        Ok(())
    }

    // Validation runs before a task is enqueued and again in the handler.

    /// Check a root project can be created.
    pub fn check_create_root(&self, workspace_id: &str, name: &str) -> Result<()> {
        validate_project_name(name)?;
        if self.store.get_project_by_name(workspace_id, name)?.is_some() {
            return Err(Error::validation_for_field(
                name,
                "name",
                format!("namespace {name} already exists in workspace {workspace_id}"),
            ));
        }
        Ok(())
    }

    /// Check a child project can be created; returns the parent.
    pub fn check_create_child(
        &self,
        workspace_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Project> {
        validate_project_name(name)?;
        let parent = self.active_project(workspace_id, parent_id)?;
        if self.store.get_project_by_name(workspace_id, name)?.is_some() {
            return Err(Error::validation_for_field(
                name,
                "name",
                format!("namespace {name} already exists in workspace {workspace_id}"),
            ));
        }
        Ok(parent)
    }

    /// Check a project can be deleted; returns it.
    ///
    /// A project with children is rejected: deletion never cascades.
    pub fn check_delete(&self, project_id: &str) -> Result<Project> {
        let project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("project", project_id))?;
        let children = self.store.count_child_projects(project_id)?;
        if children > 0 {
            return Err(Error::validation_for(
                project_id,
                format!(
                    "project {} has {children} child project(s); delete them first",
                    project.name
                ),
            ));
        }
        Ok(project)
    }

    /// Check a root project can be re-parented under `new_parent`.
    pub fn check_set_parent(&self, project_id: &str, new_parent: Option<&str>) -> Result<Project> {
        let project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("project", project_id))?;
        if project.is_anchored() {
            return Err(Error::validation_for(
                project_id,
                "anchored projects keep the parent they were created under",
            ));
        }
        if let Some(parent_id) = new_parent {
            self.active_project(&project.workspace_id, parent_id)?;
            let parents = self.store.project_parents(&project.workspace_id)?;
            if parents.would_create_cycle(project_id, parent_id)? {
                return Err(Error::validation_for(
                    project_id,
                    format!("making {parent_id} the parent of {project_id} would create a cycle"),
                ));
            }
        }
        Ok(project)
    }

    fn active_project(&self, workspace_id: &str, project_id: &str) -> Result<Project> {
        let project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("project", project_id))?;
        if project.workspace_id != workspace_id {
            return Err(Error::validation_for(
                project_id,
                format!("project {project_id} is not in workspace {workspace_id}"),
            ));
        }
        if project.status != ProjectStatus::Active {
            return Err(Error::validation_for(
                project_id,
                format!("project {project_id} is {}", project.status.as_str()),
            ));
        }
        Ok(project)
    }

    /// Create a full namespace and record it as a root project.
    pub async fn create_root_project(
        &self,
        workspace_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Project> {
        if let Some(existing) = self.existing(workspace_id, project_id, name)? {
            return Ok(existing);
        }
        validate_project_name(name)?;
        let vc = self.connector.connect(workspace_id).await?;
        vc.ensure_namespace(name, &Self::namespace_labels(workspace_id, project_id))
            .await?;
        let project = Project::root(project_id, workspace_id, name);
        self.store.insert_project(&project)?;
        info!(workspace = %workspace_id, project = %project_id, namespace = %name, "root project created");
        Ok(project)
    }

    /// Create a child namespace through an anchor and record the project.
    ///
    /// Safe to re-run: the anchor is applied, not created, and an existing
    /// row for the same id short-circuits.
    pub async fn create_child_project(
        &self,
        workspace_id: &str,
        project_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Project> {
        if let Some(existing) = self.existing(workspace_id, project_id, name)? {
            return Ok(existing);
        }
        validate_project_name(name)?;
        let parent = self
            .active_project(workspace_id, parent_id)
            .map_err(|e| Error::hierarchy_permanent(project_id, e.to_string()))?;

        let vc = self.connector.connect(workspace_id).await?;
        vc.apply_anchor(&parent.name, name).await?;
        self.wait_for_anchor(&vc, project_id, &parent.name, name)
            .await?;

        let project = Project::anchored(project_id, workspace_id, name, parent_id);
        self.store.insert_project(&project)?;
        info!(
            workspace = %workspace_id,
            project = %project_id,
            parent = %parent.name,
            namespace = %name,
            "child project created"
        );
        Ok(project)
    }

    fn existing(&self, workspace_id: &str, project_id: &str, name: &str) -> Result<Option<Project>> {
        match self.store.get_project_by_name(workspace_id, name)? {
            Some(p) if p.id == project_id => {
                debug!(project = %project_id, "project already recorded");
                Ok(Some(p))
            }
            Some(p) => Err(Error::hierarchy_permanent(
                project_id,
                format!("namespace {name} already belongs to project {}", p.id),
            )),
            None => Ok(None),
        }
    }

    async fn wait_for_anchor(
        &self,
        vc: &Arc<dyn VirtualClusterApi>,
        project_id: &str,
        parent_namespace: &str,
        name: &str,
    ) -> Result<()> {
        let vc = Arc::clone(vc);
        let project_id = project_id.to_string();
        let parent_namespace = parent_namespace.to_string();
        let name = name.to_string();
        let operation = format!("anchor {parent_namespace}/{name}");
        poll_until(
            self.config.anchor_timeout,
            self.config.poll_interval,
            operation,
            move || {
                let vc = Arc::clone(&vc);
                let project_id = project_id.clone();
                let parent_namespace = parent_namespace.clone();
                let name = name.clone();
                async move {
                    let Some(anchor) = vc.get_anchor(&parent_namespace, &name).await? else {
                        return Err(Error::hierarchy(
                            project_id,
                            format!("anchor {parent_namespace}/{name} not found"),
                        ));
                    };
                    match anchor.state() {
                        AnchorState::Ok => Ok(true),
                        state if state.is_permanent_failure() => Err(Error::hierarchy_permanent(
                            project_id,
                            format!("anchor {parent_namespace}/{name} is {state}"),
                        )),
                        _ => Ok(false),
                    }
                }
            },
        )
        .await
    }

    /// Delete a project's namespace and then its row.
    ///
    /// Anchored projects are removed by deleting the anchor; root projects
    /// have their namespace deleted directly once no anchors remain in it.
    /// Returns `false` if the project was already gone.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let Some(project) = self.store.get_project(project_id)? else {
            debug!(project = %project_id, "project already deleted");
            return Ok(false);
        };
        let children = self.store.count_child_projects(project_id)?;
        if children > 0 {
            return Err(Error::hierarchy_permanent(
                project_id,
                format!("project still has {children} child project(s)"),
            ));
        }
        self.store
            .set_project_status(project_id, ProjectStatus::Deleting, None)?;

        let vc = self.connector.connect(&project.workspace_id).await?;
        match (&project.anchor_name, &project.parent_id) {
            (Some(anchor), Some(parent_id)) => {
                let parent = self
                    .store
                    .get_project(parent_id)?
                    .ok_or_else(|| Error::not_found("project", parent_id.clone()))?;
                vc.delete_anchor(&parent.name, anchor).await?;
            }
            _ => {
                let anchors = vc.list_anchors(&project.name).await?;
                if !anchors.is_empty() {
                    return Err(Error::hierarchy(
                        project_id,
                        format!(
                            "namespace {} still holds anchors: {}",
                            project.name,
                            anchors.join(", ")
                        ),
                    ));
                }
                vc.delete_namespace(&project.name).await?;
            }
        }

        let check = Arc::clone(&vc);
        let namespace = project.name.clone();
        poll_until(
            self.config.namespace_delete_timeout,
            self.config.poll_interval,
            format!("removal of namespace {}", project.name),
            move || {
                let vc = Arc::clone(&check);
                let namespace = namespace.clone();
                async move { Ok(!vc.namespace_exists(&namespace).await?) }
            },
        )
        .await?;

        self.store.delete_project(project_id)?;
        info!(workspace = %project.workspace_id, project = %project_id, namespace = %project.name, "project deleted");
        Ok(true)
    }

    /// Re-parent a root project (`None` detaches it).
    pub async fn set_project_parent(
        &self,
        project_id: &str,
        new_parent: Option<&str>,
    ) -> Result<()> {
        let project = self
            .check_set_parent(project_id, new_parent)
            .map_err(|e| Error::hierarchy_permanent(project_id, e.to_string()))?;
        let parent_namespace = match new_parent {
            Some(parent_id) => Some(
                self.store
                    .get_project(parent_id)?
                    .ok_or_else(|| Error::not_found("project", parent_id))?
                    .name,
            ),
            None => None,
        };
        let previous = self
            .store
            .reparent_project(project_id, new_parent)
            .map_err(|e| match e {
                StoreError::Conflict(message) => Error::hierarchy_permanent(project_id, message),
                other => other.into(),
            })?;
        let applied = async {
            let vc = self.connector.connect(&project.workspace_id).await?;
            vc.set_parent(&project.name, parent_namespace).await
        }
        .await;
        if let Err(e) = applied {
            // retried from the recorded parent
            if let Err(restore) = self.store.reparent_project(project_id, previous.as_deref()) {
                warn!(project = %project_id, error = %restore, "could not restore the previous parent");
            }
            return Err(e);
        }
        info!(project = %project_id, parent = ?new_parent, "project re-parented");
        Ok(())
    }

    /// Whether any project deletion for the workspace is queued, running or
    /// unfinished.
    pub fn has_outstanding_deletions(&self, workspace_id: &str) -> Result<bool> {
        if self.store.count_deleting_projects(workspace_id)? > 0 {
            return Ok(true);
        }
        let queued = self
            .store
            .count_active_tasks(workspace_id, TaskKind::DeleteProjectAnchor)?;
        if queued > 0 {
            debug!(workspace = %workspace_id, queued, "project deletions queued");
        }
        Ok(queued > 0)
    }

    /// Record a project whose creation was abandoned so it surfaces as ERROR.
    pub fn record_failed_creation(&self, project: Project, error: &str) -> Result<()> {
        let project = Project {
            status: ProjectStatus::Error,
            last_error: Some(error.to_string()),
            ..project
        };
        match self.store.insert_project(&project) {
            Ok(_) => Ok(()),
            Err(kaas_store::StoreError::Conflict(message)) => {
                warn!(project = %project.id, %message, "cannot record failed project");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
