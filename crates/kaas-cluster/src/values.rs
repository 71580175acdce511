//! Helm values for a workspace's virtual cluster

use serde_json::{json, Map, Value};

use kaas_common::crd::{HelmChart, HelmRelease, VirtualCluster, VirtualClusterSpec};
use kaas_common::model::{NodePlacement, OidcParams, Workspace};
use kaas_common::naming::{
    host_namespace, kubeconfig_secret_name, MANAGED_BY_LABEL, MANAGED_BY_VALUE, WORKSPACE_LABEL,
};
use kaas_common::plan::Plan;
use kaas_common::{Error, Result};

/// Chart the virtual-cluster runtime installs by default
pub fn default_chart() -> HelmChart {
    HelmChart {
        name: "vcluster".to_string(),
        repo: Some("https://charts.loft.sh".to_string()),
        version: Some("0.20.0".to_string()),
    }
}

/// Everything that goes into one workspace's values document
#[derive(Clone, Debug)]
pub struct ValuesInput<'a> {
    /// Workspace id
    pub workspace_id: &'a str,
    /// Plan sizing the control plane
    pub plan: &'a Plan,
    /// OIDC wiring for the API server
    pub oidc: &'a OidcParams,
    /// Where pods may run
    pub placement: &'a NodePlacement,
    /// External host name, added to the serving certificate
    pub external_host: Option<&'a str>,
}

fn placement_json(placement: &NodePlacement) -> Value {
    json!({
        "nodeSelector": placement.node_selector,
        "tolerations": placement.tolerations,
    })
}

/// Render the values document as a JSON tree
pub fn render(input: &ValuesInput<'_>) -> Value {
    let mut control_plane = json!({
        "distro": {
            "k8s": {
                "enabled": true,
                "apiServer": {
                    "extraArgs": input.oidc.api_server_args(),
                },
            },
        },
        "statefulSet": {
            "resources": {
                "limits": {
                    "cpu": input.plan.control_plane.cpu,
                    "memory": input.plan.control_plane.memory,
                },
            },
            "labels": {
                (MANAGED_BY_LABEL): MANAGED_BY_VALUE,
                (WORKSPACE_LABEL): input.workspace_id,
            },
        },
    });
    if let Some(host) = input.external_host {
        control_plane["proxy"] = json!({ "extraSANs": [host] });
    }

    let mut sync = json!({
        "toHost": {
            "pods": { "enabled": true },
        },
    });

    if !input.placement.is_shared() {
        control_plane["statefulSet"]["scheduling"] = placement_json(input.placement);

        let tolerations: Vec<String> = input
            .placement
            .tolerations
            .iter()
            .map(|t| match &t.value {
                Some(v) => format!("{}={}:{}", t.key, v, t.effect),
                None => format!("{}:{}", t.key, t.effect),
            })
            .collect();
        sync["toHost"]["pods"]["enforceTolerations"] = json!(tolerations);
        sync["fromHost"] = json!({
            "nodes": {
                "enabled": true,
                "selector": { "labels": input.placement.node_selector },
            },
        });
    }

    let mut values = Map::new();
    values.insert("controlPlane".to_string(), control_plane);
    values.insert("sync".to_string(), sync);
    values.insert(
        "exportKubeConfig".to_string(),
        json!({ "secret": { "name": kubeconfig_secret_name(input.workspace_id) } }),
    );
    Value::Object(values)
}

/// Build the `VirtualCluster` object for a workspace
pub fn virtual_cluster(
    workspace: &Workspace,
    chart: &HelmChart,
    input: &ValuesInput<'_>,
) -> Result<VirtualCluster> {
    let values = serde_yaml::to_string(&render(input)).map_err(|e| {
        Error::serialization_for("VirtualCluster", format!("failed to render values: {e}"))
    })?;

    let mut vc = VirtualCluster::new(
        &workspace.expected_instance_name(),
        VirtualClusterSpec {
            helm_release: HelmRelease {
                chart: chart.clone(),
                values,
            },
        },
    );
    vc.metadata.namespace = Some(host_namespace(&workspace.id));
    vc.metadata.labels = Some(
        [
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (WORKSPACE_LABEL.to_string(), workspace.id.clone()),
        ]
        .into(),
    );
    Ok(vc)
}
