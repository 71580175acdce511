//! Token issuance and discovery
//!
//! Each workspace is its own issuer; all issuers share the provider's key
//! ring. Tokens carry the user's workspace groups flattened over the group
//! tree, so RBAC bindings on an ancestor group apply to members of every
//! descendant group.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kaas_common::model::{Workspace, WorkspaceStatus};
use kaas_common::naming::{issuer_url, oidc_client_id};
use kaas_common::{Error, Result};
use kaas_store::Store;

use crate::keys::{JwkSet, KeyRing, SIGNING_ALGORITHM};

/// Identity provider settings
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Public base URL; a workspace's issuer is `<base>/workspaces/<id>`
    pub issuer_base_url: String,
    /// Lifetime of issued tokens
    pub token_ttl: Duration,
    /// Token endpoint advertised instead of the issuer's own `<issuer>/token`
    pub token_endpoint: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer_base_url: "http://localhost:8080".to_string(),
            token_ttl: Duration::from_secs(10 * 60),
            token_endpoint: None,
        }
    }
}

/// Claims of an issued ID token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer (per workspace)
    pub iss: String,
    /// Stable internal user id
    pub sub: String,
    /// Virtual cluster's client id
    pub aud: String,
    /// Expiry (seconds since epoch)
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// Not before
    pub nbf: i64,
    /// Token id
    pub jti: String,
    /// User email
    pub email: String,
    /// Flattened group names, sorted
    pub groups: Vec<String>,
}

/// A signed token plus what a caller needs to use it
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// Compact JWS
    pub token: String,
    /// Key that signed it
    pub kid: String,
    /// Decoded claims
    pub claims: TokenClaims,
}

/// OpenID provider metadata for one workspace issuer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier
    pub issuer: String,
    /// Key set location
    pub jwks_uri: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Supported response types
    pub response_types_supported: Vec<String>,
    /// Supported subject identifier types
    pub subject_types_supported: Vec<String>,
    /// Signing algorithms
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Claims tokens may carry
    pub claims_supported: Vec<String>,
}

/// Per-workspace OIDC provider
pub struct IdentityProvider {
    store: Store,
    keys: Arc<KeyRing>,
    config: IdentityConfig,
}

impl IdentityProvider {
    /// Provider reading identities from `store` and signing with `keys`
    pub fn new(store: Store, keys: Arc<KeyRing>, config: IdentityConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Issuer URL of a workspace
    pub fn issuer(&self, workspace_id: &str) -> String {
        issuer_url(&self.config.issuer_base_url, workspace_id)
    }

    /// Token endpoint advertised to clients of a workspace issuer
    pub fn token_endpoint(&self, workspace_id: &str) -> String {
        match &self.config.token_endpoint {
            Some(url) => url.clone(),
            None => format!("{}/token", self.issuer(workspace_id)),
        }
    }

    /// The key ring
    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Workspace whose issuer metadata is published.
    ///
    /// A virtual cluster being provisioned already fetches discovery and
    /// keys; failed and torn-down workspaces publish nothing.
    fn published_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        match self.store.get_workspace(workspace_id)? {
            Some(ws) if !matches!(ws.status, WorkspaceStatus::Deleting | WorkspaceStatus::Error) => {
                Ok(ws)
            }
            _ => Err(Error::not_found("workspace", workspace_id)),
        }
    }

    /// Workspace tokens may be minted for: only serving ones
    fn issuing_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let ws = self.published_workspace(workspace_id)?;
        if !ws.status.is_serving() {
            return Err(Error::authentication(format!(
                "workspace {workspace_id} is {} and not issuing tokens",
                ws.status
            )));
        }
        Ok(ws)
    }

    /// Groups the user holds in the workspace, closed over ancestors, by name.
    pub fn flattened_groups(&self, user_id: &str, workspace_id: &str) -> Result<BTreeSet<String>> {
        let direct = self.store.direct_group_ids(user_id, workspace_id)?;
        let parents = self.store.group_parents(workspace_id)?;
        let names = self.store.group_names(workspace_id)?;
        let ids = parents.flatten(direct.iter().map(String::as_str))?;
        Ok(ids
            .into_iter()
            .filter_map(|id| names.get(&id).cloned())
            .collect())
    }

    /// Issue an ID token for `user_id` in `workspace_id`.
    ///
    /// Fails closed: an unknown user, a workspace that is not serving, no
    /// membership, or any lookup or signing failure yields an authentication
    /// error and no token.
    pub fn issue_token(&self, user_id: &str, workspace_id: &str) -> Result<IssuedToken> {
        self.sign(user_id, workspace_id).map_err(|e| match e {
            Error::Authentication { .. } => e,
            other => {
                warn!(user = %user_id, workspace = %workspace_id, error = %other, "token issuance refused");
                Error::authentication(format!("cannot issue token: {other}"))
            }
        })
    }

    fn sign(&self, user_id: &str, workspace_id: &str) -> Result<IssuedToken> {
        let ws = self.issuing_workspace(workspace_id)?;
        let user = self
            .store
            .get_user(user_id)?
            .ok_or_else(|| Error::authentication(format!("unknown user {user_id}")))?;
        let groups = self.flattened_groups(&user.id, &ws.id)?;
        if groups.is_empty() {
            return Err(Error::authentication(format!(
                "user {user_id} has no membership in workspace {workspace_id}"
            )));
        }

        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            iss: self.issuer(&ws.id),
            sub: user.id.clone(),
            aud: oidc_client_id(&ws.id),
            exp: now + self.config.token_ttl.as_secs() as i64,
            iat: now,
            nbf: now,
            jti: Uuid::new_v4().to_string(),
            email: user.email,
            groups: groups.into_iter().collect(),
        };

        let (kid, key) = self.keys.signer()?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.clone());
        let token = jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::authentication(format!("signing failed: {e}")))?;
        info!(
            user = %user_id,
            workspace = %workspace_id,
            kid = %kid,
            groups = claims.groups.len(),
            "token issued"
        );
        Ok(IssuedToken { token, kid, claims })
    }

    /// Re-issue a token against a still-valid one from the same issuer.
    ///
    /// The presented token only identifies the subject; membership is
    /// evaluated afresh, so a user removed from every group gets nothing.
    pub fn refresh_token(&self, workspace_id: &str, presented: &str) -> Result<IssuedToken> {
        let subject = self.verify(workspace_id, presented).map_err(|e| {
            debug!(workspace = %workspace_id, error = %e, "presented token rejected");
            Error::authentication(format!("invalid token: {e}"))
        })?;
        self.issue_token(&subject, workspace_id)
    }

    /// Subject of a token this workspace issuer signed
    fn verify(&self, workspace_id: &str, token: &str) -> Result<String> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::authentication(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::authentication("token has no key id"))?;
        let jwks = self.keys.jwks();
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| Error::authentication(format!("key {kid} is not published")))?;
        let key = DecodingKey::from_ec_components(&jwk.x, &jwk.y)
            .map_err(|e| Error::authentication(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[oidc_client_id(workspace_id)]);
        validation.set_issuer(&[self.issuer(workspace_id)]);
        validation.leeway = self.keys.config().clock_skew.as_secs();
        let data = jsonwebtoken::decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| Error::authentication(e.to_string()))?;
        Ok(data.claims.sub)
    }

    /// Discovery document for a workspace issuer
    pub fn discovery(&self, workspace_id: &str) -> Result<DiscoveryDocument> {
        let ws = self.published_workspace(workspace_id)?;
        let issuer = self.issuer(&ws.id);
        debug!(workspace = %workspace_id, "discovery document served");
        Ok(DiscoveryDocument {
            jwks_uri: format!("{issuer}/.well-known/jwks.json"),
            issuer,
            token_endpoint: self.token_endpoint(&ws.id),
            response_types_supported: vec!["id_token".to_string()],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: vec![SIGNING_ALGORITHM.to_string()],
            claims_supported: ["sub", "iss", "aud", "exp", "iat", "nbf", "jti", "email", "groups"]
                .into_iter()
                .map(String::from)
                .collect(),
        })
    }

    /// Key set for a workspace issuer
    pub fn jwks(&self, workspace_id: &str) -> Result<JwkSet> {
        self.published_workspace(workspace_id)?;
        Ok(self.keys.jwks())
    }
}
