//! Host-cluster operations used by the lifecycle manager

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, ResourceQuota, Taint};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kaas_common::crd::VirtualCluster;
use kaas_common::kube_utils::{
    self, apply, delete_ignore_missing, get_optional, get_secret_data, FIELD_MANAGER,
};
use kaas_common::naming::{KUBECONFIG_SECRET_KEY, PLAN_QUOTA_NAME};
use kaas_common::{Error, Result};

/// Operations on the shared host cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostClusterApi: Send + Sync {
    /// Create or update a namespace with the given labels
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Whether a namespace exists (terminating counts as existing)
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Delete a namespace; returns whether a delete was issued
    async fn delete_namespace(&self, name: &str) -> Result<bool>;

    /// Server-side apply the plan quota in `namespace`
    async fn apply_quota(&self, namespace: &str, hard: &BTreeMap<String, String>) -> Result<()>;

    /// Server-side apply a virtual cluster
    async fn apply_virtual_cluster(&self, vc: &VirtualCluster) -> Result<()>;

    /// Read a virtual cluster
    async fn get_virtual_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualCluster>>;

    /// Delete a virtual cluster; returns whether a delete was issued
    async fn delete_virtual_cluster(&self, namespace: &str, name: &str) -> Result<bool>;

    /// All host nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Set or remove labels (`None` removes) and replace the taint list of a node
    async fn patch_node(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
        taints: &[Taint],
    ) -> Result<()>;

    /// Kubeconfig the virtual cluster exported into `namespace/secret`
    async fn get_kubeconfig(&self, namespace: &str, secret: &str) -> Result<Option<String>>;
}

/// [`HostClusterApi`] over a kube client for the host cluster
#[derive(Clone)]
pub struct KubeHostClusterApi {
    client: Client,
}

impl KubeHostClusterApi {
    /// Wrap a host-cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HostClusterApi for KubeHostClusterApi {
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        kube_utils::ensure_namespace(&self.client, name, labels).await
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        kube_utils::namespace_exists(&self.client, name).await
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        delete_ignore_missing(&api, name).await
    }

    async fn apply_quota(&self, namespace: &str, hard: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let quota = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": {
                "name": PLAN_QUOTA_NAME,
                "namespace": namespace,
            },
            "spec": { "hard": hard },
        });
        apply(&api, PLAN_QUOTA_NAME, &quota).await?;
        debug!(namespace = %namespace, "plan quota applied");
        Ok(())
    }

    async fn apply_virtual_cluster(&self, vc: &VirtualCluster) -> Result<()> {
        let namespace = vc
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("virtual cluster has no namespace"))?;
        let name = vc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("virtual cluster has no name"))?;
        let api: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        apply(&api, name, vc).await?;
        info!(namespace = %namespace, name = %name, "virtual cluster applied");
        Ok(())
    }

    async fn get_virtual_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualCluster>> {
        let api: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn delete_virtual_cluster(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        delete_ignore_missing(&api, name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_node(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
        taints: &[Taint],
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        // Merge patch: null label values delete, and the taint list is replaced
        // as a whole.
        let patch = serde_json::json!({
            "metadata": { "labels": labels },
            "spec": { "taints": taints },
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(name, &params, &Patch::Merge(&patch)).await?;
        info!(node = %name, "node reservation updated");
        Ok(())
    }

    async fn get_kubeconfig(&self, namespace: &str, secret: &str) -> Result<Option<String>> {
        let Some(bytes) =
            get_secret_data(&self.client, secret, namespace, KUBECONFIG_SECRET_KEY).await?
        else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::serialization_for("kubeconfig", e.to_string()))
    }
}
