//! In-memory host and virtual clusters

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kaas_cluster::HostClusterApi;
use kaas_common::crd::{
    HNCConfigurationSpec, SubnamespaceAnchor, SubnamespaceAnchorSpec, SubnamespaceAnchorStatus,
    VirtualCluster, VirtualClusterStatus, PHASE_DEPLOYED,
};
use kaas_common::model::WorkspaceStatus;
use kaas_common::naming::INSTANCE_TYPE_LABEL;
use kaas_common::{Error, Result};
use kaas_hierarchy::{ClusterConnector, VirtualClusterApi};
use kaas_store::Store;
use kaas_tasks::WebhookApplier;
use serde_json::Value;

/// CA bundle the fake virtual clusters export
pub const FAKE_CA_DATA: &str = "ZmFrZS1jYQ==";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("fake state lock")
}

fn exported_kubeconfig(server: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: vcluster\n  \
           cluster:\n    \
             server: {server}\n    \
             certificate-authority-data: {FAKE_CA_DATA}\n\
         contexts: []\n\
         users: []\n"
    )
}

/// A host node of `class` carrying `labels`
pub fn node(name: &str, class: &str, labels: &[(&str, &str)]) -> Node {
    let mut all = BTreeMap::from([(INSTANCE_TYPE_LABEL.to_string(), class.to_string())]);
    all.extend(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(all),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        ..Default::default()
    }
}

#[derive(Default)]
struct HostState {
    namespaces: BTreeSet<String>,
    quotas: BTreeMap<String, BTreeMap<String, String>>,
    clusters: BTreeMap<(String, String), VirtualCluster>,
    nodes: BTreeMap<String, Node>,
    applied_statuses: Vec<WorkspaceStatus>,
    cluster_applies: usize,
    node_patches: usize,
}

/// Host cluster that deploys every virtual cluster immediately
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    quota_failures: AtomicU32,
    watched: Mutex<Option<(Store, String)>>,
}

impl FakeHost {
    /// Host with the given nodes
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let host = Self::default();
        {
            let mut state = lock(&host.state);
            for node in nodes {
                let name = node.metadata.name.clone().unwrap_or_default();
                state.nodes.insert(name, node);
            }
        }
        host
    }

    /// Fail the next `n` quota applies with a retryable error
    pub fn fail_quota(&self, n: u32) {
        self.quota_failures.store(n, Ordering::SeqCst);
    }

    /// Record the workspace's stored status each time its virtual cluster is applied
    pub fn watch_status(&self, store: Store, workspace_id: &str) {
        *lock(&self.watched) = Some((store, workspace_id.to_string()));
    }

    /// Statuses recorded by [`Self::watch_status`]
    pub fn statuses_at_apply(&self) -> Vec<WorkspaceStatus> {
        lock(&self.state).applied_statuses.clone()
    }

    /// The stored virtual cluster, if any
    pub fn virtual_cluster(&self, namespace: &str, name: &str) -> Option<VirtualCluster> {
        lock(&self.state)
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of virtual clusters on the host
    pub fn virtual_cluster_count(&self) -> usize {
        lock(&self.state).clusters.len()
    }

    /// `(virtual cluster applies, node patches)` issued so far
    pub fn write_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.cluster_applies, state.node_patches)
    }

    /// Whether a host namespace exists
    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains(name)
    }

    /// The quota applied in `namespace`
    pub fn quota(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state).quotas.get(namespace).cloned()
    }

    /// Current labels of a node
    pub fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        lock(&self.state)
            .nodes
            .get(name)
            .and_then(|n| n.metadata.labels.clone())
            .unwrap_or_default()
    }

    /// Current taint keys of a node
    pub fn node_taint_keys(&self, name: &str) -> Vec<String> {
        lock(&self.state)
            .nodes
            .get(name)
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.taints.as_ref())
            .map(|t| t.iter().map(|t| t.key.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostClusterApi for FakeHost {
    async fn ensure_namespace(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        lock(&self.state).namespaces.insert(name.to_string());
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_namespace(name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        state.quotas.remove(name);
        Ok(state.namespaces.remove(name))
    }

    async fn apply_quota(&self, namespace: &str, hard: &BTreeMap<String, String>) -> Result<()> {
        let remaining = self.quota_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.quota_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::provision(namespace, "quota admission webhook unavailable"));
        }
        lock(&self.state)
            .quotas
            .insert(namespace.to_string(), hard.clone());
        Ok(())
    }

    async fn apply_virtual_cluster(&self, vc: &VirtualCluster) -> Result<()> {
        let watched = lock(&self.watched).clone();
        let observed = match watched {
            Some((store, id)) => store.get_workspace(&id)?.map(|ws| ws.status),
            None => None,
        };
        let mut deployed = vc.clone();
        deployed.status = Some(VirtualClusterStatus {
            phase: Some(PHASE_DEPLOYED.to_string()),
            ..Default::default()
        });
        let key = (
            vc.metadata.namespace.clone().unwrap_or_default(),
            vc.metadata.name.clone().unwrap_or_default(),
        );
        let mut state = lock(&self.state);
        state.applied_statuses.extend(observed);
        state.cluster_applies += 1;
        state.clusters.insert(key, deployed);
        Ok(())
    }

    async fn get_virtual_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualCluster>> {
        Ok(self.virtual_cluster(namespace, name))
    }

    async fn delete_virtual_cluster(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(lock(&self.state)
            .clusters
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(lock(&self.state).nodes.values().cloned().collect())
    }

    async fn patch_node(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
        taints: &[Taint],
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.node_patches += 1;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found("node", name))?;
        let current = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(v) => current.insert(key.clone(), v.clone()),
                None => current.remove(key),
            };
        }
        node.spec.get_or_insert_with(NodeSpec::default).taints = Some(taints.to_vec());
        Ok(())
    }

    async fn get_kubeconfig(&self, namespace: &str, _secret: &str) -> Result<Option<String>> {
        let state = lock(&self.state);
        let exported = state.clusters.keys().any(|(ns, _)| ns == namespace);
        Ok(exported.then(|| exported_kubeconfig(&format!("https://{namespace}.svc:443"))))
    }
}

#[derive(Default)]
struct VirtualState {
    namespaces: BTreeSet<String>,
    anchors: BTreeMap<(String, String), SubnamespaceAnchor>,
    parents: BTreeMap<String, Option<String>>,
    controller_image: Option<String>,
}

/// A workspace virtual cluster whose hierarchy controller acts instantly
#[derive(Default)]
pub struct FakeVirtualCluster {
    state: Mutex<VirtualState>,
}

impl FakeVirtualCluster {
    /// Whether a namespace exists
    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains(name)
    }

    /// Whether an anchor exists
    pub fn has_anchor(&self, parent: &str, name: &str) -> bool {
        lock(&self.state)
            .anchors
            .contains_key(&(parent.to_string(), name.to_string()))
    }

    /// Image of the installed hierarchy controller
    pub fn controller_image(&self) -> Option<String> {
        lock(&self.state).controller_image.clone()
    }

    /// Hierarchy parent of a namespace
    pub fn parent_of(&self, namespace: &str) -> Option<String> {
        lock(&self.state).parents.get(namespace).cloned().flatten()
    }
}

#[async_trait]
impl VirtualClusterApi for FakeVirtualCluster {
    async fn apply_crds(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        lock(&self.state).namespaces.insert(name.to_string());
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_namespace(name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.state).namespaces.remove(name))
    }

    async fn apply_controller(&self, image: &str) -> Result<()> {
        lock(&self.state).controller_image = Some(image.to_string());
        Ok(())
    }

    async fn controller_ready(&self) -> Result<bool> {
        Ok(lock(&self.state).controller_image.is_some())
    }

    async fn apply_controller_config(&self, _spec: &HNCConfigurationSpec) -> Result<()> {
        Ok(())
    }

    async fn apply_anchor(&self, parent_namespace: &str, name: &str) -> Result<()> {
        let mut anchor = SubnamespaceAnchor::new(name, SubnamespaceAnchorSpec::default());
        anchor.metadata.namespace = Some(parent_namespace.to_string());
        anchor.status = Some(SubnamespaceAnchorStatus {
            status: Some("Ok".to_string()),
        });
        let mut state = lock(&self.state);
        state.namespaces.insert(name.to_string());
        state
            .parents
            .insert(name.to_string(), Some(parent_namespace.to_string()));
        state
            .anchors
            .insert((parent_namespace.to_string(), name.to_string()), anchor);
        Ok(())
    }

    async fn get_anchor(
        &self,
        parent_namespace: &str,
        name: &str,
    ) -> Result<Option<SubnamespaceAnchor>> {
        Ok(lock(&self.state)
            .anchors
            .get(&(parent_namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_anchor(&self, parent_namespace: &str, name: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        let removed = state
            .anchors
            .remove(&(parent_namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            state.namespaces.remove(name);
            state.parents.remove(name);
        }
        Ok(removed)
    }

    async fn list_anchors(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(lock(&self.state)
            .anchors
            .keys()
            .filter(|(parent, _)| parent == namespace)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn set_parent(&self, namespace: &str, parent: Option<String>) -> Result<()> {
        lock(&self.state)
            .parents
            .insert(namespace.to_string(), parent);
        Ok(())
    }
}

/// Connector handing out one fake virtual cluster per workspace
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<BTreeMap<String, Arc<FakeVirtualCluster>>>,
}

impl FakeConnector {
    /// The virtual cluster of `workspace_id`, created on first use
    pub fn cluster(&self, workspace_id: &str) -> Arc<FakeVirtualCluster> {
        Arc::clone(
            lock(&self.clusters)
                .entry(workspace_id.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, workspace_id: &str) -> Result<Arc<dyn VirtualClusterApi>> {
        Ok(self.cluster(workspace_id))
    }
}

/// Webhook sink remembering every event it was handed
#[derive(Default)]
pub struct RecordingApplier {
    events: Mutex<Vec<(String, String)>>,
    unavailable: AtomicBool,
}

impl RecordingApplier {
    /// `(source, event_id)` pairs applied so far
    pub fn events(&self) -> Vec<(String, String)> {
        lock(&self.events).clone()
    }

    /// Refuse every event with a retryable error until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookApplier for RecordingApplier {
    async fn apply(&self, source: &str, event_id: &str, _body: &Value) -> Result<Option<Value>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::timeout(
                format!("forward {source}/{event_id}"),
                Duration::from_secs(30),
            ));
        }
        lock(&self.events).push((source.to_string(), event_id.to_string()));
        Ok(None)
    }
}
