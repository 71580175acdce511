//! Operator alerts and webhook event deduplication

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use kaas_common::model::TaskOwner;

use crate::{from_millis, to_millis, Store, StoreError, StoreResult};

const EVENT_PENDING: &str = "pending";
const EVENT_APPLIED: &str = "applied";

/// Result of claiming an external event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventClaim {
    /// The caller owns the event and must apply it
    Claimed,
    /// Applied before; nothing to do
    AlreadyApplied,
    /// Another task holds the claim
    InFlight {
        /// Task holding the claim
        holder: String,
    },
}

/// An alert raised when a task exhausts its retries
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Owner kind ("workspace", "project", "external")
    pub owner_kind: String,
    /// Owner id
    pub owner_id: String,
    /// Task that raised it
    pub task_id: Option<String>,
    /// Human-readable detail
    pub message: String,
    /// When it was raised
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Record an alert against a task owner.
    pub fn record_alert(
        &self,
        owner: &TaskOwner,
        task_id: Option<&str>,
        message: &str,
    ) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO alerts (owner_kind, owner_id, task_id, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![owner.kind(), owner.id(), task_id, message, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// All alerts, oldest first.
    pub fn list_alerts(&self) -> StoreResult<Vec<Alert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT owner_kind, owner_id, task_id, message, created_at FROM alerts ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(owner_kind, owner_id, task_id, message, created_at)| {
                Ok(Alert {
                    owner_kind,
                    owner_id,
                    task_id,
                    message,
                    created_at: from_millis("alerts", created_at)?,
                })
            })
            .collect()
    }

    /// Whether an external event was already applied.
    pub fn is_event_processed(&self, source: &str, event_id: &str) -> StoreResult<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM processed_events
             WHERE source = ?1 AND event_id = ?2 AND state = ?3",
            params![source, event_id, EVENT_APPLIED],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Claim an external event for `task_id` before applying it.
    ///
    /// The insert and the lookup share one transaction, so exactly one task
    /// wins a fresh event. The winning task keeps its claim across
    /// redeliveries.
    pub fn claim_event(
        &self,
        source: &str,
        event_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<EventClaim> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO processed_events
                 (source, event_id, state, claimed_by, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source, event_id, EVENT_PENDING, task_id, to_millis(now)],
        )?;
        let claim = if inserted == 1 {
            EventClaim::Claimed
        } else {
            let (state, holder): (String, String) = tx.query_row(
                "SELECT state, claimed_by FROM processed_events
                 WHERE source = ?1 AND event_id = ?2",
                params![source, event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            match state.as_str() {
                EVENT_APPLIED => EventClaim::AlreadyApplied,
                _ if holder == task_id => EventClaim::Claimed,
                _ => EventClaim::InFlight { holder },
            }
        };
        tx.commit()?;
        Ok(claim)
    }

    /// Mark a claimed event as applied.
    pub fn finish_event(
        &self,
        source: &str,
        event_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = self.conn().execute(
            "UPDATE processed_events SET state = ?3, processed_at = ?5
             WHERE source = ?1 AND event_id = ?2 AND claimed_by = ?4",
            params![source, event_id, EVENT_APPLIED, task_id, to_millis(now)],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "event {source}/{event_id} is not claimed by task {task_id}"
            )));
        }
        Ok(())
    }

    /// Drop a pending claim after a failed apply so another attempt can take it.
    pub fn release_event(&self, source: &str, event_id: &str, task_id: &str) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM processed_events
             WHERE source = ?1 AND event_id = ?2 AND claimed_by = ?3 AND state = ?4",
            params![source, event_id, task_id, EVENT_PENDING],
        )?;
        Ok(())
    }
}
