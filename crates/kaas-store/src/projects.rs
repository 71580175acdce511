//! Project rows

use rusqlite::{params, OptionalExtension, Row};

use kaas_common::hierarchy::ParentMap;
use kaas_common::model::{Project, ProjectStatus};

use crate::{from_millis, to_millis, Store, StoreError, StoreResult};

const TABLE: &str = "projects";

const SELECT_PROJECT: &str = "SELECT id, workspace_id, name, parent_id, anchor_name, status, \
     last_error, created_at FROM projects";

struct RawProject {
    id: String,
    workspace_id: String,
    name: String,
    parent_id: Option<String>,
    anchor_name: Option<String>,
    status: String,
    last_error: Option<String>,
    created_at: i64,
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<RawProject> {
    Ok(RawProject {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        anchor_name: row.get(4)?,
        status: row.get(5)?,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl RawProject {
    fn decode(self) -> StoreResult<Project> {
        let status: ProjectStatus = self
            .status
            .parse()
            .map_err(|e: kaas_common::Error| StoreError::corrupt(TABLE, e.to_string()))?;
        Ok(Project {
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            parent_id: self.parent_id,
            anchor_name: self.anchor_name,
            status,
            last_error: self.last_error,
            created_at: from_millis(TABLE, self.created_at)?,
        })
    }
}

impl Store {
    /// Insert a project; returns false if a project with this id exists.
    ///
    /// A different project with the same name in the workspace is a conflict.
    pub fn insert_project(&self, project: &Project) -> StoreResult<bool> {
        let conn = self.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM projects WHERE workspace_id = ?1 AND name = ?2",
                params![project.workspace_id, project.name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) if id == project.id => return Ok(false),
            Some(id) => {
                return Err(StoreError::Conflict(format!(
                    "namespace {} already belongs to project {}",
                    project.name, id
                )))
            }
            None => {}
        }
        conn.execute(
            "INSERT INTO projects
                 (id, workspace_id, name, parent_id, anchor_name, status, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project.id,
                project.workspace_id,
                project.name,
                project.parent_id,
                project.anchor_name,
                project.status.as_str(),
                project.last_error,
                to_millis(project.created_at),
            ],
        )?;
        Ok(true)
    }

    /// Fetch a project by id.
    pub fn get_project(&self, id: &str) -> StoreResult<Option<Project>> {
        let raw = self
            .conn()
            .query_row(
                &format!("{SELECT_PROJECT} WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()?;
        raw.map(RawProject::decode).transpose()
    }

    /// Fetch a project by namespace name.
    pub fn get_project_by_name(&self, workspace_id: &str, name: &str) -> StoreResult<Option<Project>> {
        let raw = self
            .conn()
            .query_row(
                &format!("{SELECT_PROJECT} WHERE workspace_id = ?1 AND name = ?2"),
                params![workspace_id, name],
                project_from_row,
            )
            .optional()?;
        raw.map(RawProject::decode).transpose()
    }

    /// All projects in a workspace.
    pub fn list_projects(&self, workspace_id: &str) -> StoreResult<Vec<Project>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_PROJECT} WHERE workspace_id = ?1 ORDER BY created_at, name"
        ))?;
        let rows = stmt
            .query_map(params![workspace_id], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawProject::decode).collect()
    }

    /// Parent pointers of every project in a workspace.
    pub fn project_parents(&self, workspace_id: &str) -> StoreResult<ParentMap> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, parent_id FROM projects WHERE workspace_id = ?1")?;
        let rows = stmt
            .query_map(params![workspace_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, Option<String>)>>>()?;
        Ok(ParentMap::from_rows(rows))
    }

    /// Number of direct children of a project.
    pub fn count_child_projects(&self, id: &str) -> StoreResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM projects WHERE parent_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Number of projects in a workspace currently being deleted.
    pub fn count_deleting_projects(&self, workspace_id: &str) -> StoreResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM projects WHERE workspace_id = ?1 AND status = ?2",
            params![workspace_id, ProjectStatus::Deleting.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Set a project's status and last error; returns false if it is gone.
    pub fn set_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_error: Option<&str>,
    ) -> StoreResult<bool> {
        let updated = self.conn().execute(
            "UPDATE projects SET status = ?2, last_error = ?3 WHERE id = ?1",
            params![id, status.as_str(), last_error],
        )?;
        Ok(updated == 1)
    }

    /// Delete a project and the role assignments scoped to it.
    ///
    /// Refuses while child projects still point at it.
    pub fn delete_project(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let children: i64 = tx.query_row(
            "SELECT COUNT(*) FROM projects WHERE parent_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::Conflict(format!(
                "project {id} still has {children} child project(s)"
            )));
        }
        tx.execute(
            "DELETE FROM role_assignments WHERE project_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted == 1)
    }
}
