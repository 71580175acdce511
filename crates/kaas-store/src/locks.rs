//! Advisory locks with an expiry
//!
//! A lock row is a lease: a holder that dies without releasing it only
//! blocks others until `expires_at`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::{to_millis, Store, StoreResult};

impl Store {
    /// Try to take `key` for `holder` until `now + ttl`.
    ///
    /// Succeeds if the key is free, expired, or already held by `holder`
    /// (which renews it).
    pub fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let now_ms = to_millis(now);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let changed = self.conn().execute(
            "INSERT INTO advisory_locks (key, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE advisory_locks.holder = excluded.holder OR advisory_locks.expires_at <= ?4",
            params![key, holder, now_ms.saturating_add(ttl_ms), now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Release `key` if `holder` still owns it.
    pub fn release_lock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        Ok(self.conn().execute(
            "DELETE FROM advisory_locks WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )? == 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_fixtures::store;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let store = store();
        let now = Utc::now();
        assert!(store
            .try_acquire_lock("workspace/ws-1", "task-a", TTL, now)
            .expect("acquire"));
        assert!(!store
            .try_acquire_lock("workspace/ws-1", "task-b", TTL, now)
            .expect("contend"));
        assert!(store
            .try_acquire_lock("workspace/ws-2", "task-b", TTL, now)
            .expect("other key"));

        assert!(!store.release_lock("workspace/ws-1", "task-b").expect("not owner"));
        assert!(store.release_lock("workspace/ws-1", "task-a").expect("owner"));
        assert!(store
            .try_acquire_lock("workspace/ws-1", "task-b", TTL, now)
            .expect("free now"));
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let store = store();
        let now = Utc::now();
        assert!(store
            .try_acquire_lock("project/ws-1/team", "task-a", TTL, now)
            .expect("acquire"));
        let later = now + ChronoDuration::seconds(31);
        assert!(store
            .try_acquire_lock("project/ws-1/team", "task-b", TTL, later)
            .expect("takeover"));
        assert!(!store
            .release_lock("project/ws-1/team", "task-a")
            .expect("stale holder"));
    }

    #[test]
    fn test_holder_can_renew() {
        let store = store();
        let now = Utc::now();
        assert!(store
            .try_acquire_lock("workspace/ws-1", "task-a", TTL, now)
            .expect("acquire"));
        assert!(store
            .try_acquire_lock("workspace/ws-1", "task-a", TTL, now)
            .expect("renew"));
    }
}
