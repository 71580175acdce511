//! Signing keys and their rotation
//!
//! Keys move through three states. A freshly generated key is *staged*: it
//! is published in the key set but never signs. Once it has been published
//! for at least the configured lead time it is promoted to *active* and the
//! previous active key starts *retiring*. A retiring key stays published
//! until every token it signed has expired, then it is dropped.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use parking_lot::RwLock;
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use kaas_common::{Error, Result};
use kaas_store::{Store, StoredSigningKey};

/// JWS algorithm every key signs with
pub const SIGNING_ALGORITHM: &str = "ES256";

/// Rotation timing
#[derive(Clone, Debug)]
pub struct RotationConfig {
    /// How long a key stays active before a successor is staged
    pub rotation_interval: Duration,
    /// Minimum time a staged key is published before it signs
    pub publication_lead_time: Duration,
    /// Longest lifetime of any token signed by the ring
    pub max_token_ttl: Duration,
    /// Slack added to the retirement window for verifier clock drift
    pub clock_skew: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(24 * 60 * 60),
            publication_lead_time: Duration::from_secs(10 * 60),
            max_token_ttl: Duration::from_secs(15 * 60),
            clock_skew: Duration::from_secs(60),
        }
    }
}

/// Lifecycle state of one signing key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// Published, not yet signing
    Staged,
    /// Published and signing
    Active,
    /// Published until `until`, no longer signing
    Retiring {
        /// When the key may be dropped
        until: DateTime<Utc>,
    },
}

/// Public half of a key, as served in the key set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type
    pub kty: String,
    /// Curve
    pub crv: String,
    /// X coordinate (base64url)
    pub x: String,
    /// Y coordinate (base64url)
    pub y: String,
    /// Key id
    pub kid: String,
    /// Algorithm
    pub alg: String,
    /// Intended use
    #[serde(rename = "use")]
    pub use_: String,
}

/// JSON Web Key Set document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Key with id `kid`
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

struct SigningKey {
    kid: String,
    state: KeyState,
    created_at: DateTime<Utc>,
    private_key_pem: String,
    encoding: EncodingKey,
    jwk: Jwk,
}

impl SigningKey {
    fn generate(now: DateTime<Utc>) -> Result<Self> {
        let pair = KeyPair::generate()
            .map_err(|e| Error::internal_with_context("signing key", e.to_string()))?;
        Self::from_pair(Uuid::new_v4().simple().to_string(), KeyState::Staged, now, &pair)
    }

    fn from_pair(
        kid: String,
        state: KeyState,
        created_at: DateTime<Utc>,
        pair: &KeyPair,
    ) -> Result<Self> {
        // Uncompressed SEC1 point: 0x04 || X || Y
        let point = pair.public_key_raw();
        if point.len() != 65 || point[0] != 0x04 {
            return Err(Error::internal_with_context(
                "signing key",
                format!("unexpected public key encoding ({} bytes)", point.len()),
            ));
        }
        let jwk = Jwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..65]),
            kid: kid.clone(),
            alg: SIGNING_ALGORITHM.to_string(),
            use_: "sig".to_string(),
        };
        Ok(Self {
            kid,
            state,
            created_at,
            private_key_pem: pair.serialize_pem(),
            encoding: EncodingKey::from_ec_der(&pair.serialize_der()),
            jwk,
        })
    }

    fn decode(stored: &StoredSigningKey) -> Result<Self> {
        let state = match (stored.state.as_str(), stored.retire_until) {
            ("staged", _) => KeyState::Staged,
            ("active", _) => KeyState::Active,
            ("retiring", Some(until)) => KeyState::Retiring { until },
            (other, _) => {
                return Err(Error::store_fatal(format!(
                    "signing key {} has invalid state {other}",
                    stored.kid
                )))
            }
        };
        let pair = KeyPair::from_pem(&stored.private_key_pem)
            .map_err(|e| Error::store_fatal(format!("signing key {}: {e}", stored.kid)))?;
        Self::from_pair(stored.kid.clone(), state, stored.created_at, &pair)
    }

    fn encode(&self) -> StoredSigningKey {
        let (state, retire_until) = match self.state {
            KeyState::Staged => ("staged", None),
            KeyState::Active => ("active", None),
            KeyState::Retiring { until } => ("retiring", Some(until)),
        };
        StoredSigningKey {
            kid: self.kid.clone(),
            state: state.to_string(),
            retire_until,
            created_at: self.created_at,
            private_key_pem: self.private_key_pem.clone(),
        }
    }
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// Make sure some key signs. Nothing has been verified against a ring with
/// no active key, so a new first key skips the publication lead time.
fn ensure_active(keys: &mut Vec<SigningKey>, now: DateTime<Utc>) -> Result<()> {
    if keys.iter().any(|k| k.state == KeyState::Active) {
        return Ok(());
    }
    let mut first = SigningKey::generate(now)?;
    first.state = KeyState::Active;
    info!(kid = %first.kid, "signing key created");
    keys.push(first);
    Ok(())
}

fn stage_in(keys: &mut Vec<SigningKey>, now: DateTime<Utc>) -> Result<String> {
    if let Some(staged) = keys.iter().find(|k| k.state == KeyState::Staged) {
        return Ok(staged.kid.clone());
    }
    let key = SigningKey::generate(now)?;
    let kid = key.kid.clone();
    keys.push(key);
    info!(kid = %kid, "signing key staged");
    Ok(kid)
}

fn rotate_in(keys: &mut Vec<SigningKey>, config: &RotationConfig, now: DateTime<Utc>) -> Result<()> {
    let lead = span(config.publication_lead_time);
    let retire_for = span(config.max_token_ttl) + span(config.clock_skew);

    keys.retain(|k| match k.state {
        KeyState::Retiring { until } if until <= now => {
            info!(kid = %k.kid, "retired signing key dropped");
            false
        }
        _ => true,
    });

    let promotable = keys
        .iter()
        .position(|k| k.state == KeyState::Staged && k.created_at + lead <= now);
    if let Some(index) = promotable {
        for key in keys.iter_mut().filter(|k| k.state == KeyState::Active) {
            key.state = KeyState::Retiring {
                until: now + retire_for,
            };
            info!(kid = %key.kid, "signing key retiring");
        }
        keys[index].state = KeyState::Active;
        info!(kid = %keys[index].kid, "signing key promoted");
        return Ok(());
    }

    let staged = keys.iter().any(|k| k.state == KeyState::Staged);
    let active_due = keys.iter().any(|k| {
        k.state == KeyState::Active && k.created_at + span(config.rotation_interval) <= now
    });
    if !staged && active_due {
        stage_in(keys, now)?;
    }
    Ok(())
}

/// The provider's signing keys
///
/// A ring opened over a [`Store`] persists every change and reloads the
/// stored set on each step, so restarts and replicas sharing the database
/// keep publishing every key whose tokens may still be live.
pub struct KeyRing {
    keys: RwLock<Vec<SigningKey>>,
    store: Option<Store>,
    config: RotationConfig,
}

impl KeyRing {
    /// In-memory ring with one key that signs immediately.
    pub fn new(config: RotationConfig) -> Result<Self> {
        Self::new_at(config, Utc::now())
    }

    /// [`new`](Self::new) at an explicit time
    pub fn new_at(config: RotationConfig, now: DateTime<Utc>) -> Result<Self> {
        let mut keys = Vec::new();
        ensure_active(&mut keys, now)?;
        Ok(Self {
            keys: RwLock::new(keys),
            store: None,
            config,
        })
    }

    /// Ring backed by `store`: loads the persisted keys and creates an
    /// active key only if none is stored.
    pub fn open(store: Store, config: RotationConfig, now: DateTime<Utc>) -> Result<Self> {
        let ring = Self {
            keys: RwLock::new(Vec::new()),
            store: Some(store),
            config,
        };
        ring.mutate(|keys| ensure_active(keys, now))?;
        info!(keys = ring.keys.read().len(), "signing keys loaded");
        Ok(ring)
    }

    /// Apply `f` to the key set, through the store when there is one.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<SigningKey>) -> Result<T>) -> Result<T> {
        let mut cached = self.keys.write();
        let Some(store) = &self.store else {
            return f(&mut cached);
        };
        let (value, current) = store.update_signing_keys(|stored| {
            let mut current = stored
                .iter()
                .map(SigningKey::decode)
                .collect::<Result<Vec<_>>>()?;
            let value = f(&mut current)?;
            *stored = current.iter().map(SigningKey::encode).collect();
            Ok::<_, Error>((value, current))
        })?;
        *cached = current;
        Ok(value)
    }

    /// Rotation timing in force
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Generate and publish a successor key. Returns its id.
    ///
    /// At most one key is staged at a time; a second call returns the
    /// already-staged key.
    pub fn stage(&self, now: DateTime<Utc>) -> Result<String> {
        self.mutate(|keys| stage_in(keys, now))
    }

    /// Advance the rotation schedule to `now`.
    ///
    /// Drops retiring keys past their window, promotes a staged key whose
    /// lead time has elapsed, and stages a successor once the active key is
    /// due for rotation.
    pub fn rotate(&self, now: DateTime<Utc>) -> Result<()> {
        let config = self.config.clone();
        self.mutate(|keys| rotate_in(keys, &config, now))
    }

    /// Id and key of the active signing key
    pub fn signer(&self) -> Result<(String, EncodingKey)> {
        self.keys
            .read()
            .iter()
            .find(|k| k.state == KeyState::Active)
            .map(|k| (k.kid.clone(), k.encoding.clone()))
            .ok_or_else(|| Error::authentication("no active signing key"))
    }

    /// Every published key: staged, active and retiring
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.read().iter().map(|k| k.jwk.clone()).collect(),
        }
    }

    /// State of key `kid`, if published
    pub fn state_of(&self, kid: &str) -> Option<KeyState> {
        self.keys
            .read()
            .iter()
            .find(|k| k.kid == kid)
            .map(|k| k.state)
    }
}

/// Run the rotation schedule until cancelled.
pub async fn run_rotation(ring: Arc<KeyRing>, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("key rotation stopped");
                return;
            }
            _ = interval.tick() => {
                if let Err(e) = ring.rotate(Utc::now()) {
                    error!(error = %e, "key rotation failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RotationConfig {
        RotationConfig {
            rotation_interval: Duration::from_secs(3600),
            publication_lead_time: Duration::from_secs(600),
            max_token_ttl: Duration::from_secs(900),
            clock_skew: Duration::from_secs(60),
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).expect("timestamp")
    }

    #[test]
    fn test_first_key_signs_and_is_published() {
        let ring = KeyRing::new_at(config(), at(0)).expect("ring");
        let (kid, _) = ring.signer().expect("signer");
        let jwks = ring.jwks();
        let jwk = jwks.find(&kid).expect("published");
        assert_eq!(jwk.alg, "ES256");
        assert_eq!(jwk.crv, "P-256");
        assert_eq!(URL_SAFE_NO_PAD.decode(&jwk.x).expect("x").len(), 32);
    }

    #[test]
    fn test_staged_key_is_published_before_it_signs() {
        let ring = KeyRing::new_at(config(), at(0)).expect("ring");
        let (old, _) = ring.signer().expect("signer");

        // Due for rotation at 60 minutes: successor is staged, not signing
        ring.rotate(at(60)).expect("rotate");
        let staged = ring
            .jwks()
            .keys
            .into_iter()
            .map(|k| k.kid)
            .find(|kid| kid != &old)
            .expect("staged key published");
        assert_eq!(ring.state_of(&staged), Some(KeyState::Staged));
        assert_eq!(ring.signer().expect("signer").0, old);

        // Lead time not yet elapsed
        ring.rotate(at(65)).expect("rotate");
        assert_eq!(ring.signer().expect("signer").0, old);

        ring.rotate(at(70)).expect("rotate");
        assert_eq!(ring.signer().expect("signer").0, staged);
        assert!(matches!(
            ring.state_of(&old),
            Some(KeyState::Retiring { .. })
        ));
    }

    #[test]
    fn test_retiring_key_outlives_its_tokens() {
        let ring = KeyRing::new_at(config(), at(0)).expect("ring");
        let (old, _) = ring.signer().expect("signer");
        ring.stage(at(0)).expect("stage");
        ring.rotate(at(10)).expect("promote");

        // Token ttl 15m plus 1m skew: still published at 25m, gone at 26m
        ring.rotate(at(25)).expect("rotate");
        assert!(ring.jwks().find(&old).is_some());
        ring.rotate(at(26)).expect("rotate");
        assert!(ring.jwks().find(&old).is_none());
    }

    #[test]
    fn test_persisted_keys_survive_a_restart() {
        let store = Store::in_memory().expect("store");
        let before = KeyRing::open(store.clone(), config(), at(0)).expect("ring");
        let (old, old_key) = before.signer().expect("signer");
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header {
                kid: Some(old.clone()),
                ..jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256)
            },
            &serde_json::json!({"sub": "u-1", "exp": 4_000_000_000_i64}),
            &old_key,
        )
        .expect("sign");
        before.stage(at(0)).expect("stage");
        before.rotate(at(10)).expect("promote");
        let (new, _) = before.signer().expect("signer");
        drop(before);

        let after = KeyRing::open(store, config(), at(11)).expect("reopen");
        assert_eq!(after.signer().expect("signer").0, new);
        assert!(matches!(after.state_of(&old), Some(KeyState::Retiring { .. })));

        // a token from before the restart still verifies against the key set
        let jwks = after.jwks();
        let jwk = jwks.find(&old).expect("old key still published");
        let key = jsonwebtoken::DecodingKey::from_ec_components(&jwk.x, &jwk.y).expect("key");
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<serde_json::Value>(&token, &key, &validation).expect("verifies");
    }

    #[test]
    fn test_replicas_share_one_key_set() {
        let store = Store::in_memory().expect("store");
        let a = KeyRing::open(store.clone(), config(), at(0)).expect("a");
        let b = KeyRing::open(store, config(), at(0)).expect("b");
        assert_eq!(a.signer().expect("a").0, b.signer().expect("b").0);

        let staged = a.stage(at(1)).expect("stage");
        // b picks the staged key up on its next step and does not stage its own
        b.rotate(at(2)).expect("rotate");
        assert_eq!(b.state_of(&staged), Some(KeyState::Staged));
        assert_eq!(b.jwks().keys.len(), 2);
    }

    #[test]
    fn test_only_one_key_is_staged() {
        let ring = KeyRing::new_at(config(), at(0)).expect("ring");
        let first = ring.stage(at(1)).expect("stage");
        let second = ring.stage(at(2)).expect("stage");
        assert_eq!(first, second);
        assert_eq!(ring.jwks().keys.len(), 2);
    }
}
