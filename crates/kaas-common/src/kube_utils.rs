//! Kubernetes utilities shared by the lifecycle and hierarchy managers
//!
//! Every mutation goes through server-side apply with [`FIELD_MANAGER`] so a
//! re-delivered task converges on the same objects instead of racing between
//! create and update branches.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::{Error, Result};

/// Field manager for all server-side apply calls
pub const FIELD_MANAGER: &str = "kaas-control-plane";

/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep waiting.
/// Retryable errors are logged and polling continues; a non-retryable error
/// ends the wait immediately. On timeout returns [`Error::Timeout`].
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let operation = operation.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation = %operation, "condition not yet met"),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => trace!(operation = %operation, error = %e, "poll check failed, retrying"),
        }

        if start.elapsed() + poll_interval > timeout {
            return Err(Error::timeout(operation, timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the in-cluster / default config is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a kube client from kubeconfig YAML, optionally overriding the server
///
/// Virtual clusters write kubeconfigs pointing at `localhost`; callers inside
/// the host cluster override the server with the in-cluster service address.
pub async fn client_from_kubeconfig_yaml(yaml: &str, server: Option<&str>) -> Result<Client> {
    let mut kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::internal_with_context("client_from_kubeconfig", format!("invalid kubeconfig: {}", e))
    })?;
    if let Some(server) = server {
        for named in &mut kubeconfig.clusters {
            if let Some(cluster) = named.cluster.as_mut() {
                cluster.server = Some(server.to_string());
            }
        }
    }
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "client_from_kubeconfig",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to create client: {}", e),
        )
    })
}

/// Base64 CA bundle of the first cluster in a kubeconfig
pub fn kubeconfig_ca_data(yaml: &str) -> Result<Option<String>> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::internal_with_context("kubeconfig_ca_data", format!("invalid kubeconfig: {}", e))
    })?;
    Ok(kubeconfig
        .clusters
        .into_iter()
        .filter_map(|named| named.cluster)
        .find_map(|cluster| cluster.certificate_authority_data))
}

/// Whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Get an object, mapping 404 to `None`
pub async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Server-side apply an object by name
pub async fn apply<K>(
    api: &Api<K>,
    name: &str,
    obj: &(impl Serialize + std::fmt::Debug),
) -> Result<K>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    Ok(api.patch(name, &params, &Patch::Apply(obj)).await?)
}

/// Delete an object, treating "already gone" as success
///
/// Returns whether a delete request was actually issued.
pub async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Ensure a namespace exists with the given labels (idempotent)
pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": labels
        }
    });
    apply(&api, name, &ns).await?;
    Ok(())
}

/// Whether a namespace exists (terminating namespaces still count)
pub async fn namespace_exists(client: &Client, name: &str) -> Result<bool> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(get_optional(&api, name).await?.is_some())
}

/// Read one key of a secret, `None` if the secret or key is absent
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    use k8s_openapi::api::core::v1::Secret;

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = get_optional(&api, name).await?;
    Ok(secret
        .and_then(|s| s.data)
        .and_then(|mut data| data.remove(key))
        .map(|bytes| bytes.0))
}
