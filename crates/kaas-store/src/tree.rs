//! Checked parent re-pointing for the project and group trees
//!
//! The same-workspace check, the cycle check and the write run in one
//! IMMEDIATE transaction, so two concurrent moves cannot each pass their
//! check against a tree the other is about to change.

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use kaas_common::hierarchy::ParentMap;
use kaas_common::model::ProjectStatus;

use crate::{Store, StoreError, StoreResult};

#[derive(Clone, Copy)]
struct Tree {
    table: &'static str,
    kind: &'static str,
}

const PROJECTS: Tree = Tree {
    table: "projects",
    kind: "project",
};

const GROUPS: Tree = Tree {
    table: "groups",
    kind: "group",
};

fn workspace_of(tx: &Transaction<'_>, tree: Tree, id: &str) -> StoreResult<String> {
    tx.query_row(
        &format!("SELECT workspace_id FROM {} WHERE id = ?1", tree.table),
        params![id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        kind: tree.kind,
        id: id.to_string(),
    })
}

fn parents_in(tx: &Transaction<'_>, tree: Tree, workspace_id: &str) -> StoreResult<ParentMap> {
    let mut stmt = tx.prepare(&format!(
        "SELECT id, parent_id FROM {} WHERE workspace_id = ?1",
        tree.table
    ))?;
    let rows = stmt
        .query_map(params![workspace_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, Option<String>)>>>()?;
    Ok(ParentMap::from_rows(rows))
}

/// Validate and apply a move inside `tx`; returns the previous parent.
fn reparent_in(
    tx: &Transaction<'_>,
    tree: Tree,
    id: &str,
    new_parent: Option<&str>,
) -> StoreResult<Option<String>> {
    let workspace_id = workspace_of(tx, tree, id)?;
    if let Some(parent_id) = new_parent {
        if workspace_of(tx, tree, parent_id)? != workspace_id {
            return Err(StoreError::Conflict(format!(
                "{} {parent_id} is not in workspace {workspace_id}",
                tree.kind
            )));
        }
        let parents = parents_in(tx, tree, &workspace_id)?;
        let cycle = parents
            .would_create_cycle(id, parent_id)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        if cycle {
            return Err(StoreError::Conflict(format!(
                "making {parent_id} the parent of {id} would create a cycle"
            )));
        }
    }
    let previous: Option<String> = tx.query_row(
        &format!("SELECT parent_id FROM {} WHERE id = ?1", tree.table),
        params![id],
        |row| row.get(0),
    )?;
    tx.execute(
        &format!("UPDATE {} SET parent_id = ?2 WHERE id = ?1", tree.table),
        params![id, new_parent],
    )?;
    Ok(previous)
}

impl Store {
    /// Move a group under `new_parent` (or make it a root).
    ///
    /// Rejects with [`StoreError::Conflict`] when the parent is in another
    /// workspace or the move would close a loop.
    pub fn reparent_group(&self, id: &str, new_parent: Option<&str>) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        reparent_in(&tx, GROUPS, id, new_parent)?;
        tx.commit()?;
        Ok(())
    }

    /// Move a project under `new_parent` (or detach it). The parent must be
    /// ACTIVE. Returns the parent the project had before.
    pub fn reparent_project(
        &self,
        id: &str,
        new_parent: Option<&str>,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(parent_id) = new_parent {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM projects WHERE id = ?1",
                    params![parent_id],
                    |row| row.get(0),
                )
                .optional()?;
            match status {
                None => {
                    return Err(StoreError::NotFound {
                        kind: "project",
                        id: parent_id.to_string(),
                    })
                }
                Some(s) if s != ProjectStatus::Active.as_str() => {
                    return Err(StoreError::Conflict(format!(
                        "project {parent_id} is {s}"
                    )))
                }
                Some(_) => {}
            }
        }
        let previous = reparent_in(&tx, PROJECTS, id, new_parent)?;
        tx.commit()?;
        Ok(previous)
    }
}
