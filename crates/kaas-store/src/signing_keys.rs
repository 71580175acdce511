//! Persisted identity signing keys
//!
//! The key ring is stored as a whole: every rotation step rewrites the set
//! inside one immediate transaction, so replicas sharing the database never
//! interleave their updates.

use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};

use crate::{from_millis, to_millis, Store, StoreError};

const TABLE: &str = "signing_keys";

/// One signing key as stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSigningKey {
    /// Key id
    pub kid: String,
    /// "staged", "active" or "retiring"
    pub state: String,
    /// End of the retirement window for retiring keys
    pub retire_until: Option<DateTime<Utc>>,
    /// When the key was generated
    pub created_at: DateTime<Utc>,
    /// PKCS#8 private key, PEM encoded
    pub private_key_pem: String,
}

impl Store {
    /// Run `f` over the stored key set and persist whatever it leaves behind.
    ///
    /// Nothing is written if `f` fails.
    pub fn update_signing_keys<T, E>(
        &self,
        f: impl FnOnce(&mut Vec<StoredSigningKey>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let mut keys = {
            let mut stmt = tx
                .prepare(
                    "SELECT kid, state, retire_until, created_at, private_key_pem
                     FROM signing_keys ORDER BY created_at, kid",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(StoreError::from)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)?;
            rows.into_iter()
                .map(|(kid, state, retire_until, created_at, private_key_pem)| {
                    Ok(StoredSigningKey {
                        kid,
                        state,
                        retire_until: retire_until.map(|ms| from_millis(TABLE, ms)).transpose()?,
                        created_at: from_millis(TABLE, created_at)?,
                        private_key_pem,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?
        };

        let value = f(&mut keys)?;

        tx.execute("DELETE FROM signing_keys", [])
            .map_err(StoreError::from)?;
        for key in &keys {
            tx.execute(
                "INSERT INTO signing_keys (kid, state, retire_until, created_at, private_key_pem)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.kid,
                    key.state,
                    key.retire_until.map(to_millis),
                    to_millis(key.created_at),
                    key.private_key_pem,
                ],
            )
            .map_err(StoreError::from)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}
