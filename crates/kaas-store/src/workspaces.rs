//! Workspace rows and the guarded status transition

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use kaas_common::model::{DedicatedNodeConfig, Task, Workspace, WorkspaceStatus};

use crate::tasks::insert_task_row;
use crate::{from_millis, parse_json, to_json, to_millis, Store, StoreError, StoreResult};

const TABLE: &str = "workspaces";

/// Fields changed together with a status transition
///
/// `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkspaceUpdate {
    /// New plan
    pub plan: Option<String>,
    /// New dedicated-node config
    pub dedicated_nodes: Option<Option<DedicatedNodeConfig>>,
    /// New instance name
    pub instance_name: Option<Option<String>>,
    /// New last error
    pub last_error: Option<Option<String>>,
}

impl WorkspaceUpdate {
    /// Record an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    /// Set the instance name and clear any previous error
    pub fn serving(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: Some(Some(instance_name.into())),
            last_error: Some(None),
            ..Default::default()
        }
    }
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<RawWorkspace> {
    Ok(RawWorkspace {
        id: row.get(0)?,
        plan: row.get(1)?,
        status: row.get(2)?,
        dedicated_nodes: row.get(3)?,
        instance_name: row.get(4)?,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

struct RawWorkspace {
    id: String,
    plan: String,
    status: String,
    dedicated_nodes: Option<String>,
    instance_name: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawWorkspace {
    fn decode(self) -> StoreResult<Workspace> {
        let status: WorkspaceStatus = self
            .status
            .parse()
            .map_err(|e: kaas_common::Error| StoreError::corrupt(TABLE, e.to_string()))?;
        let dedicated_nodes = self
            .dedicated_nodes
            .as_deref()
            .map(|raw| parse_json(TABLE, raw))
            .transpose()?;
        Ok(Workspace {
            id: self.id,
            plan: self.plan,
            status,
            dedicated_nodes,
            instance_name: self.instance_name,
            last_error: self.last_error,
            created_at: from_millis(TABLE, self.created_at)?,
            updated_at: from_millis(TABLE, self.updated_at)?,
        })
    }
}

const SELECT_WORKSPACE: &str = "SELECT id, plan, status, dedicated_nodes, instance_name, \
     last_error, created_at, updated_at FROM workspaces";

pub(crate) fn insert_workspace_row(conn: &Connection, ws: &Workspace) -> StoreResult<bool> {
    let dedicated = ws
        .dedicated_nodes
        .as_ref()
        .map(|d| to_json(TABLE, d))
        .transpose()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO workspaces
             (id, plan, status, dedicated_nodes, instance_name, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ws.id,
            ws.plan,
            ws.status.as_str(),
            dedicated,
            ws.instance_name,
            ws.last_error,
            to_millis(ws.created_at),
            to_millis(ws.updated_at),
        ],
    )?;
    Ok(inserted == 1)
}

impl Store {
    /// Insert a workspace; returns false if the id already exists.
    pub fn insert_workspace(&self, ws: &Workspace) -> StoreResult<bool> {
        insert_workspace_row(&self.conn(), ws)
    }

    /// Insert a workspace together with the task that provisions it.
    ///
    /// Both rows commit or neither does. Returns false, writing nothing, if
    /// the workspace id is taken.
    pub fn insert_workspace_with_task(&self, ws: &Workspace, task: &Task) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !insert_workspace_row(&tx, ws)? {
            return Ok(false);
        }
        insert_task_row(&tx, task)?;
        tx.commit()?;
        debug!(workspace = %ws.id, task = %task.id, "workspace recorded with its create task");
        Ok(true)
    }

    /// Fetch a workspace by id.
    pub fn get_workspace(&self, id: &str) -> StoreResult<Option<Workspace>> {
        let raw = self
            .conn()
            .query_row(
                &format!("{SELECT_WORKSPACE} WHERE id = ?1"),
                params![id],
                workspace_from_row,
            )
            .optional()?;
        raw.map(RawWorkspace::decode).transpose()
    }

    /// All workspaces, oldest first.
    pub fn list_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_WORKSPACE} ORDER BY created_at, id"))?;
        let rows = stmt
            .query_map([], workspace_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawWorkspace::decode).collect()
    }

    /// Move a workspace to `to`, applying `update` in the same transaction.
    ///
    /// The current status is re-read under the transaction and the move is
    /// rejected if the state machine does not allow it, so concurrent
    /// completions can never move a workspace backwards.
    pub fn transition_workspace(
        &self,
        id: &str,
        to: WorkspaceStatus,
        update: WorkspaceUpdate,
    ) -> StoreResult<Workspace> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!("{SELECT_WORKSPACE} WHERE id = ?1"),
                params![id],
                workspace_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "workspace",
                id: id.to_string(),
            })?
            .decode()?;

        if !current.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: current.status,
                to,
            });
        }

        let mut next = current.clone();
        next.status = to;
        if let Some(plan) = update.plan {
            next.plan = plan;
        }
        if let Some(dedicated) = update.dedicated_nodes {
            next.dedicated_nodes = dedicated;
        }
        if let Some(instance) = update.instance_name {
            next.instance_name = instance;
        }
        if let Some(error) = update.last_error {
            next.last_error = error;
        }
        next.updated_at = Utc::now();

        let dedicated = next
            .dedicated_nodes
            .as_ref()
            .map(|d| to_json(TABLE, d))
            .transpose()?;
        tx.execute(
            "UPDATE workspaces
             SET plan = ?2, status = ?3, dedicated_nodes = ?4, instance_name = ?5,
                 last_error = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                next.plan,
                next.status.as_str(),
                dedicated,
                next.instance_name,
                next.last_error,
                to_millis(next.updated_at),
            ],
        )?;
        tx.commit()?;

        debug!(workspace = %id, from = %current.status, to = %next.status, "workspace transitioned");
        Ok(next)
    }

    /// Remove a workspace and everything scoped to it (projects, groups,
    /// role assignments). Task history is kept.
    pub fn delete_workspace(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM role_assignments WHERE workspace_id = ?1",
            params![id],
        )?;
        // Clear self-references first; row order within a DELETE is unspecified.
        tx.execute(
            "UPDATE projects SET parent_id = NULL WHERE workspace_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM projects WHERE workspace_id = ?1", params![id])?;
        tx.execute(
            "UPDATE groups SET parent_id = NULL WHERE workspace_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM groups WHERE workspace_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted == 1)
    }
}
