//! Connects the hierarchy manager to a workspace's virtual cluster

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kaas_common::kube_utils::client_from_kubeconfig_yaml;
use kaas_common::naming::{host_namespace, instance_name, kubeconfig_secret_name};
use kaas_common::{Error, Result};
use kaas_hierarchy::{ClusterConnector, KubeVirtualClusterApi, VirtualClusterApi};

use crate::host::HostClusterApi;

/// In-cluster address of a workspace's virtual API server
pub fn internal_server_url(workspace_id: &str) -> String {
    format!(
        "https://{}.{}.svc:443",
        instance_name(workspace_id),
        host_namespace(workspace_id)
    )
}

/// [`ClusterConnector`] reading the exported kubeconfig from the host
pub struct VirtualClusterConnector {
    host: Arc<dyn HostClusterApi>,
}

impl VirtualClusterConnector {
    /// Connector resolving kubeconfigs through `host`
    pub fn new(host: Arc<dyn HostClusterApi>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl ClusterConnector for VirtualClusterConnector {
    async fn connect(&self, workspace_id: &str) -> Result<Arc<dyn VirtualClusterApi>> {
        let kubeconfig = self
            .host
            .get_kubeconfig(
                &host_namespace(workspace_id),
                &kubeconfig_secret_name(workspace_id),
            )
            .await?
            .ok_or_else(|| {
                Error::provision(workspace_id, "virtual cluster has not exported a kubeconfig yet")
            })?;
        let server = internal_server_url(workspace_id);
        debug!(workspace = %workspace_id, server = %server, "connecting to virtual cluster");
        let client = client_from_kubeconfig_yaml(&kubeconfig, Some(&server)).await?;
        Ok(Arc::new(KubeVirtualClusterApi::new(client)))
    }
}
