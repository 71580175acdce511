//! Kube-backed [`VirtualClusterApi`]

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use tracing::{debug, info};

use kaas_common::crd::{
    HNCConfiguration, HNCConfigurationSpec, HierarchyConfiguration, HierarchyConfigurationSpec,
    SubnamespaceAnchor, SubnamespaceAnchorSpec, HIERARCHY_CONFIG_NAME, HNC_CONFIG_NAME,
    HNC_SYSTEM_NAMESPACE,
};
use kaas_common::kube_utils::{self, apply, delete_ignore_missing, get_optional};
use kaas_common::Result;

use crate::client::VirtualClusterApi;
use crate::controller::{self, CONTROLLER_NAME};

/// CRDs the hierarchy controller needs, as applied to every virtual cluster
pub fn hierarchy_crds() -> Vec<CustomResourceDefinition> {
    vec![
        SubnamespaceAnchor::crd(),
        HierarchyConfiguration::crd(),
        HNCConfiguration::crd(),
    ]
}

/// [`VirtualClusterApi`] over a kube client connected to the virtual cluster
#[derive(Clone)]
pub struct KubeVirtualClusterApi {
    client: Client,
}

impl KubeVirtualClusterApi {
    /// Wrap a client already pointed at the virtual cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn name_of<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl VirtualClusterApi for KubeVirtualClusterApi {
    async fn apply_crds(&self) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        for crd in hierarchy_crds() {
            let name = name_of(&crd);
            debug!(crd = %name, "applying CRD");
            apply(&api, &name, &crd).await?;
        }
        Ok(())
    }

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

    async fn apply_controller(&self, image: &str) -> Result<()> {
        let sa: Api<ServiceAccount> = Api::namespaced(self.client.clone(), HNC_SYSTEM_NAMESPACE);
        apply(&sa, CONTROLLER_NAME, &controller::service_account()).await?;

        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        apply(&roles, CONTROLLER_NAME, &controller::cluster_role()).await?;

        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        apply(&bindings, CONTROLLER_NAME, &controller::cluster_role_binding()).await?;

        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), HNC_SYSTEM_NAMESPACE);
        apply(&deployments, CONTROLLER_NAME, &controller::deployment(image)).await?;
        info!(image = %image, "hierarchy controller applied");
        Ok(())
    }

    async fn controller_ready(&self) -> Result<bool> {
        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), HNC_SYSTEM_NAMESPACE);
        let ready = get_optional(&deployments, CONTROLLER_NAME)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Ok(ready > 0)
    }

    async fn apply_controller_config(&self, spec: &HNCConfigurationSpec) -> Result<()> {
        let api: Api<HNCConfiguration> = Api::all(self.client.clone());
        let config = HNCConfiguration::new(HNC_CONFIG_NAME, spec.clone());
        apply(&api, HNC_CONFIG_NAME, &config).await?;
        Ok(())
    }

    async fn apply_anchor(&self, parent_namespace: &str, name: &str) -> Result<()> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent_namespace);
        let mut anchor = SubnamespaceAnchor::new(name, SubnamespaceAnchorSpec::default());
        anchor.metadata.namespace = Some(parent_namespace.to_string());
        apply(&api, name, &anchor).await?;
        Ok(())
    }

    async fn get_anchor(
        &self,
        parent_namespace: &str,
        name: &str,
    ) -> Result<Option<SubnamespaceAnchor>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent_namespace);
        get_optional(&api, name).await
    }

    async fn delete_anchor(&self, parent_namespace: &str, name: &str) -> Result<bool> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent_namespace);
        delete_ignore_missing(&api, name).await
    }

    async fn list_anchors(&self, namespace: &str) -> Result<Vec<String>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), namespace);
        let anchors = api.list(&ListParams::default()).await?;
        Ok(anchors.items.iter().map(|a| a.name_any()).collect())
    }

    async fn set_parent(&self, namespace: &str, parent: Option<String>) -> Result<()> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), namespace);
        let mut config = HierarchyConfiguration::new(
            HIERARCHY_CONFIG_NAME,
            HierarchyConfigurationSpec {
                parent,
                allow_cascading_deletion: None,
            },
        );
        config.metadata.namespace = Some(namespace.to_string());
        apply(&api, HIERARCHY_CONFIG_NAME, &config).await?;
        Ok(())
    }
}
