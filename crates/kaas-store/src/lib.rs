//! SQLite-backed relational store for the control plane.
//!
//! One store holds the workspace/project/group model, the durable task
//! records the engine dispatches from, advisory locks and alerts. The
//! connection sits behind a mutex, so every public method is one atomic unit
//! with respect to other workers in the process; multi-statement operations
//! additionally run inside a transaction.

// SQLite returns i64 for counts and retry numbers, which are always small
// and non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use thiserror::Error;

use kaas_common::model::WorkspaceStatus;

mod alerts;
mod identity;
mod locks;
mod projects;
mod signing_keys;
mod tasks;
mod tree;
mod workspaces;

pub use alerts::{Alert, EventClaim};
pub use signing_keys::StoredSigningKey;
pub use tasks::{FailureRecord, TaskFilter};
pub use workspaces::WorkspaceUpdate;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row could not be decoded.
    #[error("corrupt row in {table}: {details}")]
    Corrupt {
        /// Table holding the row
        table: &'static str,
        /// What failed to decode
        details: String,
    },

    /// Referenced row does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind
        kind: &'static str,
        /// Entity id
        id: String,
    },

    /// Workspace state machine violation.
    #[error("illegal transition for workspace {id}: {from} -> {to}")]
    IllegalTransition {
        /// Workspace id
        id: String,
        /// Current status
        from: WorkspaceStatus,
        /// Requested status
        to: WorkspaceStatus,
    },

    /// Request conflicts with existing rows.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    fn corrupt(table: &'static str, details: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            details: details.into(),
        }
    }
}

impl From<StoreError> for kaas_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(db) => match db.sqlite_error_code() {
                Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                    kaas_common::Error::store_fatal(db.to_string())
                }
                Some(ErrorCode::ConstraintViolation) => {
                    kaas_common::Error::validation(db.to_string())
                }
                _ => kaas_common::Error::store(db.to_string()),
            },
            StoreError::Corrupt { .. } => kaas_common::Error::store_fatal(e.to_string()),
            StoreError::NotFound { kind, id } => kaas_common::Error::not_found(kind, id),
            StoreError::IllegalTransition { ref id, .. } => {
                kaas_common::Error::validation_for(id.clone(), e.to_string())
            }
            StoreError::Conflict(message) => kaas_common::Error::validation(message),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens or creates the store at `path` (WAL mode).
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory store for testing.
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        let ok: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if ok != "ok" {
            return Err(StoreError::corrupt("sqlite_master", ok));
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::corrupt(table, format!("timestamp {ms} out of range")))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    table: &'static str,
    raw: &str,
) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt(table, e.to_string()))
}

pub(crate) fn to_json<T: serde::Serialize>(table: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::corrupt(table, e.to_string()))
}
