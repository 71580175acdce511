//! Workspace lifecycle: provision, update, tear down
//!
//! Every operation re-reads the workspace row first and is safe to re-run:
//! host objects are server-side applied, node reservations are planned against
//! what the host already has, and status transitions go through the store's
//! guarded state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use kaas_common::crd::HelmChart;
use kaas_common::kube_utils::{poll_until, DEFAULT_POLL_INTERVAL};
use kaas_common::model::{DedicatedNodeConfig, OidcParams, Workspace, WorkspaceStatus};
use kaas_common::naming::{
    host_namespace, issuer_url, kubeconfig_secret_name, oidc_client_id, DEDICATED_POOL_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, WORKSPACE_LABEL,
};
use kaas_common::plan::{Plan, PlanCatalog};
use kaas_common::{Error, Result};
use kaas_hierarchy::HierarchyManager;
use kaas_store::{Store, WorkspaceUpdate};

use crate::host::HostClusterApi;
use crate::nodes::{plan_nodes, released_taints, reserved_taints};
use crate::values::{self, default_chart, ValuesInput};

/// Lifecycle manager settings
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Chart the virtual-cluster runtime installs
    pub chart: HelmChart,
    /// Public base URL of the identity provider
    pub issuer_base_url: String,
    /// Domain under which virtual API servers are exposed (`<instance>.<domain>`)
    pub endpoint_domain: Option<String>,
    /// Bound on waiting for a virtual cluster to report ready
    pub ready_timeout: Duration,
    /// Bound on waiting for host objects to disappear
    pub teardown_timeout: Duration,
    /// Interval between status polls
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            chart: default_chart(),
            issuer_base_url: "http://localhost:8080".to_string(),
            endpoint_domain: None,
            ready_timeout: Duration::from_secs(10 * 60),
            teardown_timeout: Duration::from_secs(10 * 60),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Result of one lifecycle operation
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleStep {
    /// Changes applied; the workspace as it now stands
    Applied(Workspace),
    /// Workspace and host resources are gone
    Removed,
    /// Nothing to do
    Skipped(String),
    /// Not possible yet; try again later
    Waiting(String),
}

/// Resources a workspace should end up with after an update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceChange {
    /// New plan, `None` to keep the current one
    pub plan: Option<String>,
    /// Dedicated nodes after the update, `None` for shared placement
    pub dedicated_nodes: Option<DedicatedNodeConfig>,
}

/// Cluster lifecycle manager
pub struct LifecycleManager {
    store: Store,
    host: Arc<dyn HostClusterApi>,
    hierarchy: Arc<HierarchyManager>,
    plans: PlanCatalog,
    config: LifecycleConfig,
}

fn partial(workspace_id: &str, step: &str) -> impl Fn(Error) -> Error {
    let workspace_id = workspace_id.to_string();
    let step = step.to_string();
    move |e| {
        if e.is_retryable() && !matches!(e, Error::Timeout { .. }) {
            Error::partial_apply(workspace_id.clone(), step.clone(), e.to_string())
        } else {
            e
        }
    }
}

impl LifecycleManager {
    /// Create a manager
    pub fn new(
        store: Store,
        host: Arc<dyn HostClusterApi>,
        hierarchy: Arc<HierarchyManager>,
        plans: PlanCatalog,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            host,
            hierarchy,
            plans,
            config,
        }
    }

    /// The relational store
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The plan catalog
    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    /// OIDC wiring for a workspace's API server
    pub fn oidc_params(&self, workspace_id: &str) -> OidcParams {
        OidcParams::new(
            issuer_url(&self.config.issuer_base_url, workspace_id),
            oidc_client_id(workspace_id),
        )
    }

    /// External API server host of a workspace, if exposed
    pub fn external_host(&self, workspace: &Workspace) -> Option<String> {
        self.config
            .endpoint_domain
            .as_ref()
            .map(|domain| format!("{}.{domain}", workspace.expected_instance_name()))
    }

    /// Reject a plan/node combination before anything is enqueued.
    pub fn validate_resources(
        &self,
        workspace_id: &str,
        plan_name: &str,
        dedicated: Option<&DedicatedNodeConfig>,
    ) -> Result<()> {
        let plan = self.plans.get(plan_name)?;
        Self::check_dedicated(workspace_id, plan, dedicated)
    }

    fn check_dedicated(
        workspace_id: &str,
        plan: &Plan,
        dedicated: Option<&DedicatedNodeConfig>,
    ) -> Result<()> {
        let Some(config) = dedicated else {
            return Ok(());
        };
        if !plan.dedicated_nodes_allowed {
            return Err(Error::validation_for_field(
                workspace_id,
                "dedicatedNodes",
                format!("plan {} does not include dedicated nodes", plan.name),
            ));
        }
        config.validate(workspace_id)
    }

    fn load(&self, workspace_id: &str) -> Result<Workspace> {
        self.store
            .get_workspace(workspace_id)?
            .ok_or_else(|| Error::not_found("workspace", workspace_id))
    }

    /// Bring up a workspace's virtual cluster and move it to
    /// CONFIGURING_HIERARCHY_CONTROLLER.
    pub async fn provision(
        &self,
        workspace_id: &str,
        plan_name: &str,
        dedicated: Option<&DedicatedNodeConfig>,
        oidc: &OidcParams,
    ) -> Result<LifecycleStep> {
        let ws = self.load(workspace_id)?;
        match ws.status {
            WorkspaceStatus::PendingCreation => {}
            WorkspaceStatus::Deleting => {
                return Ok(LifecycleStep::Skipped("workspace is being deleted".into()))
            }
            WorkspaceStatus::Error => {
                return Err(Error::provision_permanent(workspace_id, "workspace is in ERROR"))
            }
            status => {
                debug!(workspace = %workspace_id, %status, "already provisioned");
                return Ok(LifecycleStep::Skipped(format!("workspace is {status}")));
            }
        }

        let plan = self.plans.get(plan_name)?;
        Self::check_dedicated(workspace_id, plan, dedicated)?;

        let desired = Workspace {
            plan: plan_name.to_string(),
            dedicated_nodes: dedicated.cloned(),
            ..ws.clone()
        };
        self.apply_workload(&desired, plan, oidc, ws.dedicated_nodes.as_ref())
            .await?;

        let ws = self.store.transition_workspace(
            workspace_id,
            WorkspaceStatus::ConfiguringHierarchyController,
            WorkspaceUpdate {
                plan: Some(plan_name.to_string()),
                dedicated_nodes: Some(dedicated.cloned()),
                last_error: Some(None),
                ..Default::default()
            },
        )?;
        info!(workspace = %workspace_id, plan = %plan_name, "virtual cluster provisioned");
        Ok(LifecycleStep::Applied(ws))
    }

    /// Install the hierarchy controller and move the workspace to RUNNING.
    pub async fn setup_hierarchy(&self, workspace_id: &str) -> Result<LifecycleStep> {
        let ws = self.load(workspace_id)?;
        match ws.status {
            WorkspaceStatus::ConfiguringHierarchyController => {}
            WorkspaceStatus::PendingCreation => {
                return Ok(LifecycleStep::Waiting("virtual cluster not provisioned yet".into()))
            }
            WorkspaceStatus::Deleting => {
                return Ok(LifecycleStep::Skipped("workspace is being deleted".into()))
            }
            WorkspaceStatus::Error => {
                return Err(Error::provision_permanent(workspace_id, "workspace is in ERROR"))
            }
            status => return Ok(LifecycleStep::Skipped(format!("workspace is {status}"))),
        }

        self.hierarchy.install_controller(workspace_id).await?;
        let ws = self.store.transition_workspace(
            workspace_id,
            WorkspaceStatus::Running,
            WorkspaceUpdate::serving(ws.expected_instance_name()),
        )?;
        info!(workspace = %workspace_id, instance = ?ws.instance_name, "workspace running");
        Ok(LifecycleStep::Applied(ws))
    }

    /// Apply a plan and/or dedicated-node change.
    ///
    /// The virtual cluster is re-pointed and confirmed ready before nodes that
    /// are no longer wanted are released. A deleting workspace is left alone.
    pub async fn update_resources(
        &self,
        workspace_id: &str,
        change: &ResourceChange,
    ) -> Result<LifecycleStep> {
        let ws = self.load(workspace_id)?;
        match ws.status {
            s if s.is_serving() => {}
            WorkspaceStatus::Deleting => {
                return Ok(LifecycleStep::Skipped("workspace is being deleted".into()))
            }
            WorkspaceStatus::PendingCreation | WorkspaceStatus::ConfiguringHierarchyController => {
                return Ok(LifecycleStep::Waiting(format!("workspace is {}", ws.status)))
            }
            status => {
                return Err(Error::provision_permanent(
                    workspace_id,
                    format!("cannot update a workspace in {status}"),
                ))
            }
        }

        let plan_name = change.plan.clone().unwrap_or_else(|| ws.plan.clone());
        let plan = self.plans.get(&plan_name)?;
        Self::check_dedicated(workspace_id, plan, change.dedicated_nodes.as_ref())?;

        // A resumed update keeps the status it was interrupted in.
        let updating = if ws.status.is_updating() {
            ws.status
        } else if change.plan.is_some() {
            WorkspaceStatus::UpdatingPlan
        } else {
            WorkspaceStatus::UpdatingNodes
        };
        self.store
            .transition_workspace(workspace_id, updating, WorkspaceUpdate::default())?;

        let desired = Workspace {
            plan: plan_name.clone(),
            dedicated_nodes: change.dedicated_nodes.clone(),
            ..ws.clone()
        };
        let oidc = self.oidc_params(workspace_id);
        self.apply_workload(&desired, plan, &oidc, ws.dedicated_nodes.as_ref())
            .await?;

        let ws = self.store.transition_workspace(
            workspace_id,
            WorkspaceStatus::Running,
            WorkspaceUpdate {
                plan: Some(plan_name),
                dedicated_nodes: Some(change.dedicated_nodes.clone()),
                last_error: Some(None),
                ..Default::default()
            },
        )?;
        info!(
            workspace = %workspace_id,
            plan = %ws.plan,
            dedicated = ws.dedicated_nodes.as_ref().map(|d| d.count).unwrap_or(0),
            "workspace resources updated"
        );
        Ok(LifecycleStep::Applied(ws))
    }

    /// Tear a workspace down once no project deletions are outstanding.
    pub async fn deprovision(&self, workspace_id: &str) -> Result<LifecycleStep> {
        let Some(ws) = self.store.get_workspace(workspace_id)? else {
            return Ok(LifecycleStep::Skipped("workspace already removed".into()));
        };
        if ws.status != WorkspaceStatus::Deleting {
            self.store.transition_workspace(
                workspace_id,
                WorkspaceStatus::Deleting,
                WorkspaceUpdate::default(),
            )?;
        }
        if self.hierarchy.has_outstanding_deletions(workspace_id)? {
            return Ok(LifecycleStep::Waiting(
                "project deletions are still outstanding".into(),
            ));
        }

        let namespace = host_namespace(workspace_id);
        let name = ws.expected_instance_name();
        if self.host.delete_virtual_cluster(&namespace, &name).await? {
            info!(workspace = %workspace_id, "virtual cluster deletion requested");
        }
        let host = Arc::clone(&self.host);
        let (ns, vc) = (namespace.clone(), name.clone());
        poll_until(
            self.config.teardown_timeout,
            self.config.poll_interval,
            format!("removal of virtual cluster {name}"),
            move || {
                let host = Arc::clone(&host);
                let (ns, vc) = (ns.clone(), vc.clone());
                async move { Ok(host.get_virtual_cluster(&ns, &vc).await?.is_none()) }
            },
        )
        .await?;

        let nodes = self.host.list_nodes().await?;
        let node_plan = plan_nodes(&nodes, workspace_id, None)?;
        self.release_nodes(&nodes, &node_plan.release, ws.dedicated_nodes.as_ref())
            .await
            .map_err(partial(workspace_id, "release-nodes"))?;

        self.host.delete_namespace(&namespace).await?;
        let host = Arc::clone(&self.host);
        let ns = namespace.clone();
        poll_until(
            self.config.teardown_timeout,
            self.config.poll_interval,
            format!("removal of namespace {namespace}"),
            move || {
                let host = Arc::clone(&host);
                let ns = ns.clone();
                async move { Ok(!host.namespace_exists(&ns).await?) }
            },
        )
        .await?;

        self.store.delete_workspace(workspace_id)?;
        info!(workspace = %workspace_id, "workspace torn down");
        Ok(LifecycleStep::Removed)
    }

    /// Host-internal admin kubeconfig of a workspace's virtual cluster.
    ///
    /// Never handed to tenants; they get OIDC kubeconfigs instead.
    pub async fn get_host_kubeconfig(&self, workspace_id: &str) -> Result<String> {
        self.load(workspace_id)?;
        self.host
            .get_kubeconfig(
                &host_namespace(workspace_id),
                &kubeconfig_secret_name(workspace_id),
            )
            .await?
            .ok_or_else(|| Error::not_found("kubeconfig", workspace_id))
    }

    /// Record the instance name on a workspace whose provisioning gave up
    /// after the virtual cluster object was created.
    pub async fn record_partial_provision(&self, workspace_id: &str) -> Result<()> {
        let Some(ws) = self.store.get_workspace(workspace_id)? else {
            return Ok(());
        };
        if ws.instance_name.is_some() || ws.status == WorkspaceStatus::Deleting {
            return Ok(());
        }
        let name = ws.expected_instance_name();
        if self
            .host
            .get_virtual_cluster(&host_namespace(workspace_id), &name)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.store.transition_workspace(
            workspace_id,
            WorkspaceStatus::Error,
            WorkspaceUpdate {
                instance_name: Some(Some(name)),
                ..Default::default()
            },
        )?;
        warn!(workspace = %workspace_id, "workspace partially provisioned");
        Ok(())
    }

    /// Apply namespace, node reservations, quota and virtual cluster for the
    /// desired workspace state, wait for it to be ready, then release nodes no
    /// longer wanted.
    async fn apply_workload(
        &self,
        desired: &Workspace,
        plan: &Plan,
        oidc: &OidcParams,
        previous: Option<&DedicatedNodeConfig>,
    ) -> Result<()> {
        let workspace_id = desired.id.as_str();
        let namespace = host_namespace(workspace_id);
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (WORKSPACE_LABEL.to_string(), workspace_id.to_string()),
        ]);
        self.host.ensure_namespace(&namespace, &labels).await?;

        let nodes = self.host.list_nodes().await?;
        let node_plan = plan_nodes(&nodes, workspace_id, desired.dedicated_nodes.as_ref())?;
        if let Some(config) = &desired.dedicated_nodes {
            self.reserve_nodes(&nodes, workspace_id, config, &node_plan.reserve)
                .await
                .map_err(partial(workspace_id, "reserve-nodes"))?;
        }

        self.host
            .apply_quota(&namespace, &plan.quota.hard())
            .await
            .map_err(partial(workspace_id, "quota"))?;

        let placement = desired.placement();
        let external_host = self.external_host(desired);
        let input = ValuesInput {
            workspace_id,
            plan,
            oidc,
            placement: &placement,
            external_host: external_host.as_deref(),
        };
        let vc = values::virtual_cluster(desired, &self.config.chart, &input)?;
        self.host
            .apply_virtual_cluster(&vc)
            .await
            .map_err(partial(workspace_id, "virtual-cluster"))?;
        self.wait_ready(workspace_id, &desired.expected_instance_name())
            .await?;

        self.release_nodes(&nodes, &node_plan.release, previous)
            .await
            .map_err(partial(workspace_id, "release-nodes"))?;
        Ok(())
    }

    async fn wait_ready(&self, workspace_id: &str, name: &str) -> Result<()> {
        let host = Arc::clone(&self.host);
        let namespace = host_namespace(workspace_id);
        let ws = workspace_id.to_string();
        let vc = name.to_string();
        poll_until(
            self.config.ready_timeout,
            self.config.poll_interval,
            format!("virtual cluster {name} ready"),
            move || {
                let host = Arc::clone(&host);
                let (namespace, ws, vc) = (namespace.clone(), ws.clone(), vc.clone());
                async move {
                    let Some(cluster) = host.get_virtual_cluster(&namespace, &vc).await? else {
                        return Ok(false);
                    };
                    let status = cluster.status.unwrap_or_default();
                    if status.is_failed() {
                        return Err(Error::provision_permanent(
                            ws,
                            format!(
                                "virtual cluster release failed: {}",
                                status.message.unwrap_or_default()
                            ),
                        ));
                    }
                    Ok(status.is_ready())
                }
            },
        )
        .await
    }

    async fn reserve_nodes(
        &self,
        nodes: &[Node],
        workspace_id: &str,
        config: &DedicatedNodeConfig,
        names: &[String],
    ) -> Result<()> {
        let labels = BTreeMap::from([(
            DEDICATED_POOL_LABEL.to_string(),
            Some(workspace_id.to_string()),
        )]);
        let patches = nodes
            .iter()
            .filter(|n| n.metadata.name.as_ref().is_some_and(|name| names.contains(name)))
            .map(|node| {
                let taints = reserved_taints(node, workspace_id, config);
                let labels = &labels;
                async move {
                    let name = node.metadata.name.as_deref().unwrap_or_default();
                    self.host.patch_node(name, labels, &taints).await
                }
            });
        try_join_all(patches).await?;
        if !names.is_empty() {
            info!(workspace = %workspace_id, nodes = ?names, "nodes reserved");
        }
        Ok(())
    }

    async fn release_nodes(
        &self,
        nodes: &[Node],
        names: &[String],
        previous: Option<&DedicatedNodeConfig>,
    ) -> Result<()> {
        let extra_keys: Vec<String> = previous
            .map(|c| c.taints.iter().map(|t| t.key.clone()).collect())
            .unwrap_or_default();
        let labels = BTreeMap::from([(DEDICATED_POOL_LABEL.to_string(), None)]);
        let patches = nodes
            .iter()
            .filter(|n| n.metadata.name.as_ref().is_some_and(|name| names.contains(name)))
            .map(|node| {
                let taints = released_taints(node, &extra_keys);
                let labels = &labels;
                async move {
                    let name = node.metadata.name.as_deref().unwrap_or_default();
                    self.host.patch_node(name, labels, &taints).await
                }
            });
        try_join_all(patches).await?;
        if !names.is_empty() {
            info!(nodes = ?names, "nodes released");
        }
        Ok(())
    }
}
