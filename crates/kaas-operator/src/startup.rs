//! Wiring and the long-running loops
//!
//! [`assemble`] builds every component from already-constructed cluster
//! access, so tests can drive the full pipeline against fakes. [`run`]
//! constructs the real cluster clients and runs the task engine, the key
//! rotation loop and the identity endpoints until cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kaas_cluster::{
    HostClusterApi, KubeHostClusterApi, LifecycleConfig, LifecycleManager, VirtualClusterConnector,
    WorkspaceTaskHandler,
};
use kaas_common::kube_utils::create_client;
use kaas_common::model::TaskKind;
use kaas_common::plan::PlanCatalog;
use kaas_common::{Error, Result};
use kaas_hierarchy::{ClusterConnector, HierarchyConfig, HierarchyManager, ProjectTaskHandler};
use kaas_identity::{
    identity_router, run_rotation, serve, IdentityConfig, IdentityProvider, KeyRing,
    RotationConfig,
};
use kaas_store::Store;
use kaas_tasks::{
    EngineConfig, HandlerRegistry, HttpForwardApplier, TaskEngine, TaskHandler, TaskQueue,
    WebhookApplier, WebhookHandler,
};

use crate::config::Settings;
use crate::control_plane::ControlPlane;

/// How often the rotation schedule is advanced
pub const KEY_ROTATION_TICK: Duration = Duration::from_secs(60);

/// Request timeout for forwarded webhook events
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Applier used when no forward URL is configured
struct RejectingApplier;

#[async_trait]
impl WebhookApplier for RejectingApplier {
    async fn apply(&self, source: &str, event_id: &str, _body: &Value) -> Result<Option<Value>> {
        Err(Error::validation_for(
            format!("{source}/{event_id}"),
            "no webhook forward URL is configured",
        ))
    }
}

/// Cluster access and knobs [`assemble`] needs
pub struct Backends {
    /// Host cluster operations
    pub host: Arc<dyn HostClusterApi>,
    /// Access to workspace virtual clusters
    pub connector: Arc<dyn ClusterConnector>,
    /// External event sink
    pub applier: Arc<dyn WebhookApplier>,
    /// Plans offered to tenants
    pub plans: PlanCatalog,
    /// Engine tuning
    pub engine: EngineConfig,
    /// Lifecycle timing
    pub lifecycle: LifecycleConfig,
    /// Hierarchy timing
    pub hierarchy: HierarchyConfig,
}

/// Everything the binary runs
pub struct Components {
    /// Request-layer facade
    pub control_plane: ControlPlane,
    /// Worker pool
    pub engine: Arc<TaskEngine>,
    /// Signing keys
    pub keys: Arc<KeyRing>,
    /// OIDC provider
    pub identity: Arc<IdentityProvider>,
}

/// Handler table covering every task kind
pub fn registry(
    workspaces: Arc<WorkspaceTaskHandler>,
    projects: Arc<ProjectTaskHandler>,
    webhooks: Arc<WebhookHandler>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for kind in [
        TaskKind::CreateWorkspace,
        TaskKind::DeleteWorkspace,
        TaskKind::UpdatePlan,
        TaskKind::UpdateDedicatedNodes,
        TaskKind::SetupHierarchyController,
    ] {
        registry.register(kind, Arc::clone(&workspaces) as Arc<dyn TaskHandler>);
    }
    for kind in [
        TaskKind::CreateRootProject,
        TaskKind::CreateProjectAnchor,
        TaskKind::DeleteProjectAnchor,
        TaskKind::SetProjectParent,
    ] {
        registry.register(kind, Arc::clone(&projects) as Arc<dyn TaskHandler>);
    }
    registry.register(TaskKind::ExternalWebhookApply, webhooks);
    registry
}

/// Build every component over `store` and `backends`.
pub fn assemble(settings: &Settings, store: Store, backends: Backends) -> Result<Components> {
    let queue = TaskQueue::new(store.clone());

    let hierarchy = Arc::new(HierarchyManager::new(
        store.clone(),
        backends.connector,
        HierarchyConfig {
            controller_image: settings.hierarchy_controller_image.clone(),
            ..backends.hierarchy
        },
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        backends.host,
        Arc::clone(&hierarchy),
        backends.plans,
        LifecycleConfig {
            issuer_base_url: settings.issuer_base_url.clone(),
            endpoint_domain: settings.endpoint_domain.clone(),
            ..backends.lifecycle
        },
    ));

    let keys = Arc::new(KeyRing::open(
        store.clone(),
        RotationConfig {
            rotation_interval: Duration::from_secs(settings.key_rotation_secs),
            publication_lead_time: Duration::from_secs(settings.key_publication_lead_secs),
            max_token_ttl: settings.token_ttl(),
            ..Default::default()
        },
        Utc::now(),
    )?);
    let identity = Arc::new(IdentityProvider::new(
        store.clone(),
        Arc::clone(&keys),
        IdentityConfig {
            issuer_base_url: settings.issuer_base_url.clone(),
            token_ttl: settings.token_ttl(),
            token_endpoint: settings.token_endpoint.clone(),
        },
    ));

    let handlers = registry(
        Arc::new(WorkspaceTaskHandler::new(Arc::clone(&lifecycle), queue.clone())),
        Arc::new(ProjectTaskHandler::new(Arc::clone(&hierarchy))),
        Arc::new(WebhookHandler::new(store, backends.applier)),
    );
    let engine = Arc::new(TaskEngine::new(
        queue.clone(),
        handlers,
        EngineConfig {
            workers: settings.workers,
            ..backends.engine
        },
    ));

    Ok(Components {
        control_plane: ControlPlane::new(queue, lifecycle, hierarchy, Arc::clone(&identity)),
        engine,
        keys,
        identity,
    })
}

/// Connect to the host cluster, build everything and run until `cancel`.
pub async fn run(settings: Settings, cancel: CancellationToken) -> anyhow::Result<()> {
    let store = Store::open(&settings.database_path)?;
    info!(path = %settings.database_path.display(), "store opened");

    let client = create_client(settings.host_kubeconfig.as_deref()).await?;
    let host: Arc<dyn HostClusterApi> = Arc::new(KubeHostClusterApi::new(client));
    let connector = Arc::new(VirtualClusterConnector::new(Arc::clone(&host)));
    let applier: Arc<dyn WebhookApplier> = match &settings.webhook_forward_url {
        Some(url) => Arc::new(HttpForwardApplier::new(url.clone(), WEBHOOK_TIMEOUT)?),
        None => {
            warn!("no webhook forward URL configured; external events will fail");
            Arc::new(RejectingApplier)
        }
    };
    let plans = match &settings.plan_catalog {
        Some(path) => PlanCatalog::load(path)?,
        None => PlanCatalog::default(),
    };
    info!(plans = ?plans.names(), "plan catalog loaded");

    let components = assemble(
        &settings,
        store,
        Backends {
            host,
            connector,
            applier,
            plans,
            engine: EngineConfig::default(),
            lifecycle: LifecycleConfig::default(),
            hierarchy: HierarchyConfig::default(),
        },
    )?;

    let mut tasks = JoinSet::new();
    let engine = Arc::clone(&components.engine);
    let engine_cancel = cancel.clone();
    tasks.spawn(async move {
        engine
            .run(engine_cancel)
            .await
            .map_err(|e| anyhow::anyhow!("task engine stopped: {e}"))
    });

    let keys = Arc::clone(&components.keys);
    let rotation_cancel = cancel.clone();
    tasks.spawn(async move {
        run_rotation(keys, KEY_ROTATION_TICK, rotation_cancel).await;
        Ok(())
    });

    let router = identity_router(Arc::clone(&components.identity));
    let addr = settings.listen_addr;
    let serve_cancel = cancel.clone();
    tasks.spawn(async move {
        serve(addr, router, serve_cancel)
            .await
            .map_err(|e| anyhow::anyhow!("identity endpoints stopped: {e}"))
    });

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("task panicked: {e}")));
        if let Err(e) = result {
            cancel.cancel();
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    info!("control plane stopped");
    outcome
}
