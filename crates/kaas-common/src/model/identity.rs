//! Users, groups and role assignments
//!
//! These rows are owned by the request layer's membership operations. The
//! control plane only reads them, except for removing role assignments when a
//! project is deleted.

use serde::{Deserialize, Serialize};

/// A platform user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable internal id, used as the token subject
    pub id: String,
    /// Email address
    pub email: String,
}

/// A node in a workspace's group tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group id
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Group name, emitted in the groups claim
    pub name: String,
    /// Parent group, `None` at the workspace root
    pub parent_id: Option<String>,
}

/// Preset workspace-wide roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetRole {
    /// Full control
    Admin,
    /// Read/write
    Editor,
    /// Read only
    Viewer,
}

impl PresetRole {
    /// Kubernetes ClusterRole the preset binds to
    pub fn cluster_role(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "edit",
            Self::Viewer => "view",
        }
    }
}

/// What a role assignment grants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum RoleScope {
    /// A named role inside one project namespace
    Project {
        /// Project id
        project_id: String,
        /// Role name
        role: String,
    },
    /// A preset role across the whole workspace
    Workspace {
        /// Preset role
        preset: PresetRole,
    },
}

/// Binds a group to exactly one scoped role
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    /// Assignment id
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Group granted the role
    pub group_id: String,
    /// The granted role
    pub scope: RoleScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_roles_map_to_cluster_roles() {
        assert_eq!(PresetRole::Admin.cluster_role(), "admin");
        assert_eq!(PresetRole::Editor.cluster_role(), "edit");
        assert_eq!(PresetRole::Viewer.cluster_role(), "view");
    }

    #[test]
    fn test_role_scope_is_tagged() {
        let scope = RoleScope::Workspace {
            preset: PresetRole::Viewer,
        };
        let json = serde_json::to_value(&scope).ok();
        assert_eq!(
            json,
            Some(serde_json::json!({"scope": "workspace", "preset": "viewer"}))
        );
    }
}
