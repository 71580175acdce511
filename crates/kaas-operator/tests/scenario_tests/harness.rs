//! A fully assembled control plane over the fakes

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;

use kaas_cluster::LifecycleConfig;
use kaas_common::model::{
    DedicatedNodeConfig, OidcParams, TaskKind, TaskPayload, Workspace, WorkspaceStatus,
};
use kaas_common::naming::{issuer_url, oidc_client_id};
use kaas_common::plan::PlanCatalog;
use kaas_common::retry::RetryConfig;
use kaas_hierarchy::HierarchyConfig;
use kaas_operator::{assemble, Backends, Components, ControlPlane, Settings};
use kaas_store::Store;
use kaas_tasks::{Disposition, EngineConfig, TaskReport};

use super::fakes::{FakeConnector, FakeHost, RecordingApplier};

pub const ISSUER_BASE: &str = "https://id.example.com";
pub const ENDPOINT_DOMAIN: &str = "kaas.example.com";

/// Upper bound on engine steps per drain, so a livelock fails the test
const MAX_STEPS: usize = 64;

pub struct Harness {
    pub store: Store,
    pub host: Arc<FakeHost>,
    pub connector: Arc<FakeConnector>,
    pub applier: Arc<RecordingApplier>,
    pub components: Components,
}

/// Engine config whose retries are due immediately
pub fn immediate_retries() -> EngineConfig {
    let retry_overrides: HashMap<TaskKind, RetryConfig> = TaskKind::ALL
        .iter()
        .map(|kind| {
            (
                *kind,
                RetryConfig {
                    initial_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                    ..kind.retry_config()
                },
            )
        })
        .collect();
    EngineConfig {
        retry_overrides,
        ..Default::default()
    }
}

impl Harness {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self::with_engine(nodes, EngineConfig::default())
    }

    pub fn with_engine(nodes: Vec<Node>, engine: EngineConfig) -> Self {
        let store = Store::in_memory().expect("in-memory store");
        let host = Arc::new(FakeHost::with_nodes(nodes));
        let connector = Arc::new(FakeConnector::default());
        let applier = Arc::new(RecordingApplier::default());
        let settings = Settings {
            issuer_base_url: ISSUER_BASE.to_string(),
            endpoint_domain: Some(ENDPOINT_DOMAIN.to_string()),
            workers: engine.workers,
            ..Default::default()
        };
        let backends = Backends {
            host: host.clone(),
            connector: connector.clone(),
            applier: applier.clone(),
            plans: PlanCatalog::default(),
            engine,
            lifecycle: LifecycleConfig {
                ready_timeout: Duration::from_millis(500),
                teardown_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
            hierarchy: HierarchyConfig {
                controller_ready_timeout: Duration::from_millis(500),
                anchor_timeout: Duration::from_millis(500),
                namespace_delete_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
        };
        let components = assemble(&settings, store.clone(), backends).expect("assemble");
        Self {
            store,
            host,
            connector,
            applier,
            components,
        }
    }

    pub fn control_plane(&self) -> &ControlPlane {
        &self.components.control_plane
    }

    /// Process one due task
    pub async fn step(&self) -> Option<TaskReport> {
        self.components.engine.run_once().await.expect("engine step")
    }

    /// Process due tasks until none is left
    pub async fn drain(&self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        for _ in 0..MAX_STEPS {
            match self.step().await {
                Some(report) => reports.push(report),
                None => return reports,
            }
        }
        panic!("queue did not drain after {MAX_STEPS} steps: {reports:?}");
    }

    pub fn workspace(&self, id: &str) -> Workspace {
        self.store
            .get_workspace(id)
            .expect("read workspace")
            .expect("workspace exists")
    }

    pub fn submit_create(
        &self,
        id: &str,
        plan: &str,
        dedicated_nodes: Option<DedicatedNodeConfig>,
    ) -> kaas_common::Result<String> {
        self.control_plane().submit_task(TaskPayload::CreateWorkspace {
            workspace_id: id.to_string(),
            plan: plan.to_string(),
            dedicated_nodes,
            oidc: OidcParams::new(issuer_url(ISSUER_BASE, id), oidc_client_id(id)),
        })
    }

    /// Create a workspace and run it to RUNNING
    pub async fn running_workspace(&self, id: &str, plan: &str) -> Workspace {
        self.submit_create(id, plan, None).expect("submit create");
        let reports = self.drain().await;
        assert!(
            reports
                .iter()
                .all(|r| r.disposition == Disposition::Completed),
            "unexpected reports: {reports:?}"
        );
        let ws = self.workspace(id);
        assert_eq!(ws.status, WorkspaceStatus::Running);
        ws
    }
}
