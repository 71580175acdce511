//! HTTP endpoints for the workspace issuers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::IdentityError;
use crate::keys::JwkSet;
use crate::provider::{DiscoveryDocument, IdentityProvider};

async fn discovery_handler(
    State(provider): State<Arc<IdentityProvider>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<DiscoveryDocument>, IdentityError> {
    Ok(Json(provider.discovery(&workspace_id)?))
}

async fn jwks_handler(
    State(provider): State<Arc<IdentityProvider>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<JwkSet>, IdentityError> {
    Ok(Json(provider.jwks(&workspace_id)?))
}

/// Body of a successful token response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The new ID token
    pub id_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Seconds until `id_token` expires
    pub expires_in: i64,
}

async fn token_handler(
    State(provider): State<Arc<IdentityProvider>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, IdentityError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| IdentityError::Unauthorized("bearer token required".to_string()))?;
    let issued = provider.refresh_token(&workspace_id, presented.trim())?;
    Ok(Json(TokenResponse {
        expires_in: issued.claims.exp - issued.claims.iat,
        id_token: issued.token,
        token_type: "Bearer".to_string(),
    }))
}

/// Discovery, key-set and token routes for every workspace issuer
pub fn identity_router(provider: Arc<IdentityProvider>) -> Router {
    Router::new()
        .route(
            "/workspaces/{workspace_id}/.well-known/openid-configuration",
            get(discovery_handler),
        )
        .route(
            "/workspaces/{workspace_id}/.well-known/jwks.json",
            get(jwks_handler),
        )
        .route("/workspaces/{workspace_id}/token", post(token_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(provider)
}

/// Serve `router` on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), IdentityError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "identity endpoints listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyRing, RotationConfig};
    use crate::provider::IdentityConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kaas_common::model::{Group, User, Workspace, WorkspaceStatus};
    use kaas_store::{Store, WorkspaceUpdate};
    use tower::ServiceExt;

    /// ws-1 is provisioning; ws-2 is running with alice in its only group
    fn provider() -> Arc<IdentityProvider> {
        let store = Store::in_memory().expect("store");
        for id in ["ws-1", "ws-2"] {
            store
                .insert_workspace(&Workspace::pending(id, "standard", None))
                .expect("workspace");
        }
        store
            .transition_workspace(
                "ws-2",
                WorkspaceStatus::ConfiguringHierarchyController,
                WorkspaceUpdate::default(),
            )
            .expect("configuring");
        store
            .transition_workspace("ws-2", WorkspaceStatus::Running, WorkspaceUpdate::serving("vc-ws-2"))
            .expect("running");
        store
            .upsert_user(&User {
                id: "u-alice".to_string(),
                email: "alice@example.com".to_string(),
            })
            .expect("user");
        store
            .insert_group(&Group {
                id: "g1".to_string(),
                workspace_id: "ws-2".to_string(),
                name: "dev".to_string(),
                parent_id: None,
            })
            .expect("group");
        store.add_group_member("g1", "u-alice").expect("member");

        let keys = Arc::new(KeyRing::new(RotationConfig::default()).expect("keys"));
        Arc::new(IdentityProvider::new(store, keys, IdentityConfig::default()))
    }

    async fn send(
        provider: Arc<IdentityProvider>,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = identity_router(provider)
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        send(provider(), request).await
    }

    fn token_request(workspace_id: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/workspaces/{workspace_id}/token"));
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn integration_discovery_document_is_served() {
        let (status, body) = get_json("/workspaces/ws-1/.well-known/openid-configuration").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["issuer"], "http://localhost:8080/workspaces/ws-1");
        assert_eq!(
            body["token_endpoint"],
            "http://localhost:8080/workspaces/ws-1/token"
        );
    }

    #[tokio::test]
    async fn integration_jwks_lists_the_signing_key() {
        let (status, body) = get_json("/workspaces/ws-1/.well-known/jwks.json").await;
        assert_eq!(status, StatusCode::OK);
        let keys = body["keys"].as_array().expect("keys");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["kty"], "EC");
        assert_eq!(keys[0]["use"], "sig");
    }

    #[tokio::test]
    async fn integration_unknown_workspace_is_not_found() {
        let (status, body) = get_json("/workspaces/nope/.well-known/jwks.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn integration_token_endpoint_reissues_a_valid_token() {
        let provider = provider();
        let issued = provider.issue_token("u-alice", "ws-2").expect("token");

        let (status, body) = send(
            Arc::clone(&provider),
            token_request("ws-2", Some(&issued.token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["expires_in"], 600);
        let fresh = body["id_token"].as_str().expect("id token");
        assert_ne!(fresh, issued.token);
        assert!(provider.refresh_token("ws-2", fresh).is_ok());
    }

    #[tokio::test]
    async fn integration_token_endpoint_requires_a_bearer_token() {
        let provider = provider();
        let (status, body) = send(Arc::clone(&provider), token_request("ws-2", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "access_denied");

        let (status, _) = send(provider, token_request("ws-2", Some("garbage"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
