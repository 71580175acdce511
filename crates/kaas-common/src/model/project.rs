//! Project (namespace) model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status of a project's namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    /// Namespace exists
    Active,
    /// Deletion in progress
    Deleting,
    /// Namespace stuck or creation exhausted its retries
    Error,
}

impl ProjectStatus {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Deleting => "DELETING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "DELETING" => Ok(Self::Deleting),
            "ERROR" => Ok(Self::Error),
            other => Err(Error::serialization_for(
                "ProjectStatus",
                format!("unknown project status '{other}'"),
            )),
        }
    }
}

/// A namespace inside a workspace's virtual cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project id
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Namespace name
    pub name: String,
    /// Parent project, `None` for root namespaces
    pub parent_id: Option<String>,
    /// Anchor name, set iff the namespace was created through an anchor
    pub anchor_name: Option<String>,
    /// Status
    pub status: ProjectStatus,
    /// Last error recorded against the project
    pub last_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Project created through an anchor in its parent's namespace
    pub fn anchored(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        parent_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            anchor_name: Some(name.clone()),
            name,
            parent_id: Some(parent_id.into()),
            status: ProjectStatus::Active,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Full namespace created directly
    pub fn root(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            parent_id: None,
            anchor_name: None,
            status: ProjectStatus::Active,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the namespace is owned by an anchor
    pub fn is_anchored(&self) -> bool {
        self.anchor_name.is_some()
    }
}
