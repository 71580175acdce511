//! Tenant kubeconfigs
//!
//! One cluster, one user, one context. The user authenticates with the
//! `oidc` auth provider carrying the issued ID token and the issuer it came
//! from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kaas_common::naming::oidc_client_id;
use kaas_common::{Error, Result};

use crate::provider::{IdentityProvider, IssuedToken};

/// Kubeconfig document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Always "Config"
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Connection details
    pub cluster: ClusterEntry,
}

/// Cluster connection details
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// CA bundle, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Credentials
    pub user: UserEntry,
}

/// User credentials
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Auth provider stanza
    pub auth_provider: AuthProvider,
}

/// Auth provider stanza
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthProvider {
    /// Provider name ("oidc")
    pub name: String,
    /// Provider settings
    pub config: BTreeMap<String, String>,
}

/// Context entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Cluster and user references
    pub context: ContextEntry,
}

/// Context references
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

/// Where the tenant reaches a workspace's API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEndpoint {
    /// API server URL
    pub server: String,
    /// CA bundle, base64
    pub ca_data: Option<String>,
}

/// Build the kubeconfig for an issued token
pub fn build_kubeconfig(
    workspace_id: &str,
    endpoint: &ClusterEndpoint,
    issued: &IssuedToken,
    token_url: &str,
) -> Kubeconfig {
    let cluster_name = format!("kaas-{workspace_id}");
    let user_name = format!("{}@{cluster_name}", issued.claims.email);

    let config = BTreeMap::from([
        ("client-id".to_string(), oidc_client_id(workspace_id)),
        ("id-token".to_string(), issued.token.clone()),
        ("idp-issuer-url".to_string(), issued.claims.iss.clone()),
        ("token-url".to_string(), token_url.to_string()),
    ]);

    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: cluster_name.clone(),
            cluster: ClusterEntry {
                server: endpoint.server.clone(),
                certificate_authority_data: endpoint.ca_data.clone(),
            },
        }],
        users: vec![NamedUser {
            name: user_name.clone(),
            user: UserEntry {
                auth_provider: AuthProvider {
                    name: "oidc".to_string(),
                    config,
                },
            },
        }],
        contexts: vec![NamedContext {
            name: cluster_name.clone(),
            context: ContextEntry {
                cluster: cluster_name.clone(),
                user: user_name,
            },
        }],
        current_context: cluster_name,
    }
}

/// Issue a token for `user_id` and render a kubeconfig around it.
pub fn generate_kubeconfig(
    provider: &IdentityProvider,
    user_id: &str,
    workspace_id: &str,
    endpoint: &ClusterEndpoint,
) -> Result<String> {
    let issued = provider.issue_token(user_id, workspace_id)?;
    let kubeconfig = build_kubeconfig(
        workspace_id,
        endpoint,
        &issued,
        &provider.token_endpoint(workspace_id),
    );
    serde_yaml::to_string(&kubeconfig)
        .map_err(|e| Error::serialization_for("kubeconfig", e.to_string()))
}
