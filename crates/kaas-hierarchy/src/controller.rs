//! Manifests for the in-cluster hierarchy controller

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, HTTPGetAction, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kaas_common::crd::{HNCConfigurationSpec, PropagatedResource, HNC_SYSTEM_NAMESPACE};
use kaas_common::naming::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Controller deployment, service account and RBAC name
pub const CONTROLLER_NAME: &str = "hnc-controller-manager";

/// Default controller image
pub const DEFAULT_CONTROLLER_IMAGE: &str = "gcr.io/k8s-staging-multitenancy/hnc-manager:v1.1.0";

const HEALTH_PORT: i32 = 8081;

/// Namespaces the controller never manages
const EXCLUDED_NAMESPACES: &[&str] = &[
    "kube-system",
    "kube-public",
    "kube-node-lease",
    HNC_SYSTEM_NAMESPACE,
];

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), CONTROLLER_NAME.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app.kubernetes.io/name".to_string(), CONTROLLER_NAME.to_string())])
}

/// Service account the controller runs as
pub fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_NAME.to_string()),
            namespace: Some(HNC_SYSTEM_NAMESPACE.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Cluster role; the controller copies arbitrary propagated objects
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_NAME.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Binding of [`cluster_role`] to [`service_account`]
pub fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_NAME.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CONTROLLER_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CONTROLLER_NAME.to_string(),
            namespace: Some(HNC_SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

/// Controller deployment running `image`
pub fn deployment(image: &str) -> Deployment {
    let mut args = vec![
        "--enable-internal-cert-management".to_string(),
        "--cert-restart-on-secret-refresh".to_string(),
    ];
    args.extend(
        EXCLUDED_NAMESPACES
            .iter()
            .map(|ns| format!("--excluded-namespace={ns}")),
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_NAME.to_string()),
            namespace: Some(HNC_SYSTEM_NAMESPACE.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(CONTROLLER_NAME.to_string()),
                    containers: vec![Container {
                        name: "manager".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(vec!["/manager".to_string()]),
                        args: Some(args),
                        ports: Some(vec![ContainerPort {
                            name: Some("health".to_string()),
                            container_port: HEALTH_PORT,
                            ..Default::default()
                        }]),
                        readiness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/readyz".to_string()),
                                port: IntOrString::Int(HEALTH_PORT),
                                ..Default::default()
                            }),
                            period_seconds: Some(5),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Controller configuration propagating RBAC plus any extra resources
pub fn controller_config(extra: &[PropagatedResource]) -> HNCConfigurationSpec {
    let mut resources = vec![
        PropagatedResource::propagate("rbac.authorization.k8s.io", "roles"),
        PropagatedResource::propagate("rbac.authorization.k8s.io", "rolebindings"),
    ];
    for resource in extra {
        if !resources
            .iter()
            .any(|r| r.group == resource.group && r.resource == resource.resource)
        {
            resources.push(resource.clone());
        }
    }
    HNCConfigurationSpec { resources }
}
