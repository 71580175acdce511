//! Durable task records and the claim/complete/fail queue operations
//!
//! A task is claimed by flipping it to `IN_PROGRESS` with a lease in a
//! single `UPDATE ... RETURNING` statement, so two workers can never claim the
//! same row. Leases that expire without a completion (a crashed worker) are
//! handed back to the queue by [`Store::requeue_expired`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use kaas_common::model::{Task, TaskAttempt, TaskKind, TaskPayload, TaskStatus};

use crate::{from_millis, parse_json, to_json, to_millis, Store, StoreError, StoreResult};

const TABLE: &str = "tasks";

const TASK_COLUMNS: &str = "id, kind, payload, status, retry_count, max_retries, last_error, \
     result, available_at, created_at, updated_at";

/// How a failed attempt should be recorded
#[derive(Clone, Debug, PartialEq)]
pub struct FailureRecord {
    /// Error detail
    pub error: String,
    /// When to try again; `None` finishes the task as failed
    pub retry_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    /// Schedule another attempt at `at`
    pub fn retry_at(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: error.into(),
            retry_at: Some(at),
        }
    }

    /// Give up on the task
    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry_at: None,
        }
    }
}

/// Which tasks [`Store::list_tasks`] returns; unset fields match anything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks scoped to this workspace
    pub workspace_id: Option<String>,
    /// Only tasks of this kind
    pub kind: Option<TaskKind>,
    /// Only tasks in this status
    pub status: Option<TaskStatus>,
    /// Page size; `None` returns every match
    pub limit: Option<usize>,
    /// Matches to skip
    pub offset: usize,
}

struct RawTask {
    id: String,
    kind: String,
    payload: String,
    status: String,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    result: Option<String>,
    available_at: i64,
    created_at: i64,
    updated_at: i64,
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        last_error: row.get(6)?,
        result: row.get(7)?,
        available_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl RawTask {
    fn decode(self) -> StoreResult<Task> {
        let kind: TaskKind = self
            .kind
            .parse()
            .map_err(|e: kaas_common::Error| StoreError::corrupt(TABLE, e.to_string()))?;
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: kaas_common::Error| StoreError::corrupt(TABLE, e.to_string()))?;
        let payload: TaskPayload = parse_json(TABLE, &self.payload)?;
        if payload.kind() != kind {
            return Err(StoreError::corrupt(
                TABLE,
                format!(
                    "task {} has kind {} but a {} payload",
                    self.id,
                    kind,
                    payload.kind()
                ),
            ));
        }
        let result = self
            .result
            .as_deref()
            .map(|raw| parse_json(TABLE, raw))
            .transpose()?;
        Ok(Task {
            id: self.id,
            kind,
            payload,
            status,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            last_error: self.last_error,
            result,
            available_at: from_millis(TABLE, self.available_at)?,
            created_at: from_millis(TABLE, self.created_at)?,
            updated_at: from_millis(TABLE, self.updated_at)?,
        })
    }
}

fn append_attempt(
    conn: &rusqlite::Connection,
    task_id: &str,
    attempt: i64,
    outcome: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO task_attempts (task_id, attempt, outcome, error, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, attempt, outcome, error, to_millis(now)],
    )?;
    Ok(())
}

pub(crate) fn insert_task_row(conn: &rusqlite::Connection, task: &Task) -> StoreResult<()> {
    let owner = task.owner();
    let payload = to_json(TABLE, &task.payload)?;
    let result = task
        .result
        .as_ref()
        .map(|r| to_json(TABLE, r))
        .transpose()?;
    conn.execute(
        "INSERT INTO tasks
             (id, kind, payload, owner_kind, owner_id, workspace_id, status, retry_count,
              max_retries, last_error, result, available_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            task.id,
            task.kind.as_str(),
            payload,
            owner.kind(),
            owner.id(),
            task.payload.workspace_id(),
            task.status.as_str(),
            task.retry_count,
            task.max_retries,
            task.last_error,
            result,
            to_millis(task.available_at),
            to_millis(task.created_at),
            to_millis(task.updated_at),
        ],
    )?;
    Ok(())
}

impl Store {
    /// Persist a new task.
    pub fn insert_task(&self, task: &Task) -> StoreResult<()> {
        insert_task_row(&self.conn(), task)?;
        debug!(task = %task.id, kind = %task.kind, "task enqueued");
        Ok(())
    }

    /// Fetch a task by id.
    pub fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()?;
        raw.map(RawTask::decode).transpose()
    }

    /// Claim the oldest runnable task, leasing it until `now + lease`.
    pub fn claim_next(&self, now: DateTime<Utc>, lease: Duration) -> StoreResult<Option<Task>> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let now_ms = to_millis(now);
        let raw = self
            .conn()
            .query_row(
                &format!(
                    "UPDATE tasks
                     SET status = ?1, lease_expires_at = ?2, updated_at = ?3
                     WHERE seq = (
                         SELECT seq FROM tasks
                         WHERE status IN (?4, ?5) AND available_at <= ?3
                         ORDER BY available_at, seq
                         LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    TaskStatus::InProgress.as_str(),
                    now_ms.saturating_add(lease_ms),
                    now_ms,
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Retrying.as_str(),
                ],
                task_from_row,
            )
            .optional()?;
        raw.map(RawTask::decode).transpose()
    }

    /// Record a successful attempt.
    pub fn complete_task(
        &self,
        id: &str,
        result: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = result.map(|r| to_json(TABLE, r)).transpose()?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let retry_count: i64 = tx
            .query_row(
                "UPDATE tasks
                 SET status = ?2, result = ?3, lease_expires_at = NULL, updated_at = ?4
                 WHERE id = ?1 AND status = ?5
                 RETURNING retry_count",
                params![
                    id,
                    TaskStatus::CompletedSuccess.as_str(),
                    result,
                    to_millis(now),
                    TaskStatus::InProgress.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| not_in_progress(id))?;
        append_attempt(&tx, id, retry_count + 1, "success", None, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt, either rescheduling the task or finishing it.
    pub fn fail_task(
        &self,
        id: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<Task> {
        let (status, available_at) = match failure.retry_at {
            Some(at) => (TaskStatus::Retrying, Some(to_millis(at))),
            None => (TaskStatus::CompletedFailure, None),
        };
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let raw = tx
            .query_row(
                &format!(
                    "UPDATE tasks
                     SET status = ?2, retry_count = retry_count + 1, last_error = ?3,
                         available_at = COALESCE(?4, available_at),
                         lease_expires_at = NULL, updated_at = ?5
                     WHERE id = ?1 AND status = ?6
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    id,
                    status.as_str(),
                    failure.error,
                    available_at,
                    to_millis(now),
                    TaskStatus::InProgress.as_str(),
                ],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| not_in_progress(id))?;
        append_attempt(&tx, id, raw.retry_count, "failure", Some(&failure.error), now)?;
        tx.commit()?;
        raw.decode()
    }

    /// Hand a claimed task back without consuming an attempt.
    ///
    /// Used when the task's advisory lock is held elsewhere or the handler
    /// asked to be re-run later.
    pub fn release_task(
        &self,
        id: &str,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let retry_count: i64 = tx
            .query_row(
                "UPDATE tasks
                 SET status = CASE retry_count WHEN 0 THEN ?2 ELSE ?3 END,
                     available_at = ?4, lease_expires_at = NULL, updated_at = ?5
                 WHERE id = ?1 AND status = ?6
                 RETURNING retry_count",
                params![
                    id,
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Retrying.as_str(),
                    to_millis(available_at),
                    to_millis(now),
                    TaskStatus::InProgress.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| not_in_progress(id))?;
        append_attempt(&tx, id, retry_count + 1, "deferred", Some(reason), now)?;
        tx.commit()?;
        Ok(())
    }

    /// Return tasks whose lease ran out to the queue. Returns how many moved.
    pub fn requeue_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now_ms = to_millis(now);
        let moved = self.conn().execute(
            "UPDATE tasks
             SET status = CASE retry_count WHEN 0 THEN ?1 ELSE ?2 END,
                 available_at = ?3, lease_expires_at = NULL, updated_at = ?3
             WHERE status = ?4 AND lease_expires_at IS NOT NULL AND lease_expires_at < ?3",
            params![
                TaskStatus::Pending.as_str(),
                TaskStatus::Retrying.as_str(),
                now_ms,
                TaskStatus::InProgress.as_str(),
            ],
        )?;
        if moved > 0 {
            warn!(count = moved, "requeued tasks with expired leases");
        }
        Ok(moved)
    }

    /// Every task recorded for a workspace, oldest first.
    pub fn tasks_for_workspace(&self, workspace_id: &str) -> StoreResult<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE workspace_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![workspace_id], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawTask::decode).collect()
    }

    /// Tasks matching `filter`, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let offset = i64::try_from(filter.offset).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR workspace_id = ?1)
               AND (?2 IS NULL OR kind = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY seq DESC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    filter.workspace_id,
                    filter.kind.map(|k| k.as_str()),
                    filter.status.map(|st| st.as_str()),
                    limit,
                    offset,
                ],
                task_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawTask::decode).collect()
    }

    /// Put a task that finished as failed back in the queue with a fresh
    /// attempt budget. The attempt log is kept; a `retried` entry marks
    /// where the new round starts.
    pub fn retry_task(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Task> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match current.as_deref() {
            None => {
                return Err(StoreError::NotFound {
                    kind: "task",
                    id: id.to_string(),
                })
            }
            Some(status) if status != TaskStatus::CompletedFailure.as_str() => {
                return Err(StoreError::Conflict(format!(
                    "task {id} is {status}; only failed tasks can be retried"
                )))
            }
            Some(_) => {}
        }
        let raw = tx.query_row(
            &format!(
                "UPDATE tasks
                 SET status = ?2, retry_count = 0, last_error = NULL, result = NULL,
                     available_at = ?3, lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1
                 RETURNING {TASK_COLUMNS}"
            ),
            params![id, TaskStatus::Pending.as_str(), to_millis(now)],
            task_from_row,
        )?;
        append_attempt(&tx, id, 0, "retried", None, now)?;
        tx.commit()?;
        debug!(task = %id, "failed task requeued");
        raw.decode()
    }

    /// Number of non-terminal tasks of `kind` for a workspace.
    pub fn count_active_tasks(&self, workspace_id: &str, kind: TaskKind) -> StoreResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE workspace_id = ?1 AND kind = ?2 AND status NOT IN (?3, ?4)",
            params![
                workspace_id,
                kind.as_str(),
                TaskStatus::CompletedSuccess.as_str(),
                TaskStatus::CompletedFailure.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Attempt history of a task.
    pub fn task_attempts(&self, task_id: &str) -> StoreResult<Vec<TaskAttempt>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, attempt, outcome, error, finished_at FROM task_attempts
             WHERE task_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(task_id, attempt, outcome, error, finished_at)| {
                Ok(TaskAttempt {
                    task_id,
                    attempt: attempt as u32,
                    outcome,
                    error,
                    finished_at: from_millis("task_attempts", finished_at)?,
                })
            })
            .collect()
    }
}

fn not_in_progress(id: &str) -> StoreError {
    StoreError::Conflict(format!("task {id} is not in progress"))
}
