//! Users, groups, memberships and role assignments

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};

use kaas_common::hierarchy::ParentMap;
use kaas_common::model::{Group, PresetRole, RoleAssignment, RoleScope, User};

use crate::{Store, StoreError, StoreResult};

const ROLE_TABLE: &str = "role_assignments";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
    })
}

struct RawAssignment {
    id: String,
    workspace_id: String,
    group_id: String,
    project_id: Option<String>,
    role: Option<String>,
    preset: Option<String>,
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<RawAssignment> {
    Ok(RawAssignment {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        group_id: row.get(2)?,
        project_id: row.get(3)?,
        role: row.get(4)?,
        preset: row.get(5)?,
    })
}

fn parse_preset(raw: &str) -> StoreResult<PresetRole> {
    match raw {
        "admin" => Ok(PresetRole::Admin),
        "editor" => Ok(PresetRole::Editor),
        "viewer" => Ok(PresetRole::Viewer),
        other => Err(StoreError::corrupt(
            ROLE_TABLE,
            format!("unknown preset role '{other}'"),
        )),
    }
}

fn preset_str(preset: PresetRole) -> &'static str {
    match preset {
        PresetRole::Admin => "admin",
        PresetRole::Editor => "editor",
        PresetRole::Viewer => "viewer",
    }
}

impl RawAssignment {
    fn decode(self) -> StoreResult<RoleAssignment> {
        let scope = match (self.project_id, self.role, self.preset) {
            (Some(project_id), Some(role), None) => RoleScope::Project { project_id, role },
            (None, None, Some(preset)) => RoleScope::Workspace {
                preset: parse_preset(&preset)?,
            },
            _ => {
                return Err(StoreError::corrupt(
                    ROLE_TABLE,
                    format!("assignment {} has no single scope", self.id),
                ))
            }
        };
        Ok(RoleAssignment {
            id: self.id,
            workspace_id: self.workspace_id,
            group_id: self.group_id,
            scope,
        })
    }
}

impl Store {
    /// Insert or update a user.
    pub fn upsert_user(&self, user: &User) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO users (id, email) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET email = excluded.email",
            params![user.id, user.email],
        )?;
        Ok(())
    }

    /// Fetch a user by id.
    pub fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, email FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Insert a group. The parent, if any, must be in the same workspace.
    pub fn insert_group(&self, group: &Group) -> StoreResult<()> {
        let conn = self.conn();
        if let Some(parent) = &group.parent_id {
            let parent_ws: Option<String> = conn
                .query_row(
                    "SELECT workspace_id FROM groups WHERE id = ?1",
                    params![parent],
                    |row| row.get(0),
                )
                .optional()?;
            if parent_ws.as_deref() != Some(group.workspace_id.as_str()) {
                return Err(StoreError::Conflict(format!(
                    "parent group {parent} is not in workspace {}",
                    group.workspace_id
                )));
            }
        }
        conn.execute(
            "INSERT INTO groups (id, workspace_id, name, parent_id) VALUES (?1, ?2, ?3, ?4)",
            params![group.id, group.workspace_id, group.name, group.parent_id],
        )?;
        Ok(())
    }

    /// Fetch a group by id.
    pub fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, workspace_id, name, parent_id FROM groups WHERE id = ?1",
                params![id],
                group_from_row,
            )
            .optional()?)
    }

    /// All groups in a workspace.
    pub fn list_groups(&self, workspace_id: &str) -> StoreResult<Vec<Group>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, name, parent_id FROM groups
             WHERE workspace_id = ?1 ORDER BY name",
        )?;
        let groups = stmt
            .query_map(params![workspace_id], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Parent pointers of every group in a workspace.
    pub fn group_parents(&self, workspace_id: &str) -> StoreResult<ParentMap> {
        Ok(ParentMap::from_rows(
            self.list_groups(workspace_id)?
                .into_iter()
                .map(|g| (g.id, g.parent_id)),
        ))
    }

    /// Group id to name for a workspace.
    pub fn group_names(&self, workspace_id: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .list_groups(workspace_id)?
            .into_iter()
            .map(|g| (g.id, g.name))
            .collect())
    }

    /// Delete a group; refuses while child groups exist.
    pub fn delete_group(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn();
        let children: i64 = conn.query_row(
            "SELECT COUNT(*) FROM groups WHERE parent_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::Conflict(format!(
                "cannot delete group {id} with {children} child group(s)"
            )));
        }
        Ok(conn.execute("DELETE FROM groups WHERE id = ?1", params![id])? == 1)
    }

    /// Add a user to a group (idempotent).
    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            params![group_id, user_id],
        )?;
        Ok(())
    }

    /// Remove a user from a group.
    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )? == 1)
    }

    /// Groups of a workspace the user is a direct member of.
    pub fn direct_group_ids(&self, user_id: &str, workspace_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT g.id FROM group_members m JOIN groups g ON g.id = m.group_id
             WHERE m.user_id = ?1 AND g.workspace_id = ?2 ORDER BY g.id",
        )?;
        let ids = stmt
            .query_map(params![user_id, workspace_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Insert a role assignment.
    pub fn insert_role_assignment(&self, assignment: &RoleAssignment) -> StoreResult<()> {
        let (project_id, role, preset) = match &assignment.scope {
            RoleScope::Project { project_id, role } => {
                (Some(project_id.as_str()), Some(role.as_str()), None)
            }
            RoleScope::Workspace { preset } => (None, None, Some(preset_str(*preset))),
        };
        self.conn().execute(
            "INSERT INTO role_assignments (id, workspace_id, group_id, project_id, role, preset)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assignment.id,
                assignment.workspace_id,
                assignment.group_id,
                project_id,
                role,
                preset
            ],
        )?;
        Ok(())
    }

    /// Role assignments scoped to one project.
    pub fn role_assignments_for_project(&self, project_id: &str) -> StoreResult<Vec<RoleAssignment>> {
        self.query_assignments(
            "SELECT id, workspace_id, group_id, project_id, role, preset
             FROM role_assignments WHERE project_id = ?1 ORDER BY id",
            project_id,
        )
    }

    /// Every role assignment in a workspace.
    pub fn role_assignments_for_workspace(
        &self,
        workspace_id: &str,
    ) -> StoreResult<Vec<RoleAssignment>> {
        self.query_assignments(
            "SELECT id, workspace_id, group_id, project_id, role, preset
             FROM role_assignments WHERE workspace_id = ?1 ORDER BY id",
            workspace_id,
        )
    }

    fn query_assignments(&self, sql: &str, key: &str) -> StoreResult<Vec<RoleAssignment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let raw = stmt
            .query_map(params![key], assignment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawAssignment::decode).collect()
    }
}
