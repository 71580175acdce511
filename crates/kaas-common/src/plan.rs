//! Plan catalog: quotas and control-plane sizing per plan

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Plan used when none is given
pub const DEFAULT_PLAN: &str = "starter";

/// Resource quota applied to a workspace's host namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    /// Total CPU (e.g., "8")
    pub cpu: String,
    /// Total memory (e.g., "16Gi")
    pub memory: String,
    /// Total requested storage
    pub storage: String,
    /// Maximum pods
    pub pods: u32,
    /// Maximum services
    pub services: u32,
    /// Maximum persistent volume claims
    pub persistent_volume_claims: u32,
}

impl QuotaLimits {
    /// `spec.hard` map of a ResourceQuota
    pub fn hard(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("requests.cpu".to_string(), self.cpu.clone()),
            ("limits.cpu".to_string(), self.cpu.clone()),
            ("requests.memory".to_string(), self.memory.clone()),
            ("limits.memory".to_string(), self.memory.clone()),
            ("requests.storage".to_string(), self.storage.clone()),
            ("pods".to_string(), self.pods.to_string()),
            ("services".to_string(), self.services.to_string()),
            (
                "persistentvolumeclaims".to_string(),
                self.persistent_volume_claims.to_string(),
            ),
        ])
    }
}

/// Resources for the virtual cluster's own control plane pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneResources {
    /// CPU limit
    pub cpu: String,
    /// Memory limit
    pub memory: String,
}

/// One subscription plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Plan name
    pub name: String,
    /// Workspace quota
    pub quota: QuotaLimits,
    /// Control-plane pod sizing
    pub control_plane: ControlPlaneResources,
    /// Whether workspaces on this plan may reserve dedicated nodes
    #[serde(default)]
    pub dedicated_nodes_allowed: bool,
}

#[derive(Deserialize)]
struct CatalogFile {
    plans: Vec<Plan>,
}

/// Named plans known to the control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: BTreeMap<String, Plan>,
}

fn plan(
    name: &str,
    quota: (&str, &str, &str, u32, u32, u32),
    control_plane: (&str, &str),
    dedicated_nodes_allowed: bool,
) -> Plan {
    let (cpu, memory, storage, pods, services, pvcs) = quota;
    Plan {
        name: name.to_string(),
        quota: QuotaLimits {
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            storage: storage.to_string(),
            pods,
            services,
            persistent_volume_claims: pvcs,
        },
        control_plane: ControlPlaneResources {
            cpu: control_plane.0.to_string(),
            memory: control_plane.1.to_string(),
        },
        dedicated_nodes_allowed,
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::from_plans(vec![
            plan("starter", ("2", "4Gi", "20Gi", 20, 10, 5), ("500m", "512Mi"), false),
            plan("standard", ("4", "8Gi", "50Gi", 50, 25, 10), ("1", "1Gi"), false),
            plan("professional", ("8", "16Gi", "100Gi", 100, 50, 20), ("1", "1Gi"), true),
            plan("enterprise", ("32", "64Gi", "500Gi", 500, 200, 100), ("2", "2Gi"), true),
        ])
    }
}

impl PlanCatalog {
    /// Build from an explicit list
    pub fn from_plans(plans: Vec<Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    /// Parse a catalog file (`plans: [...]`)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        if file.plans.is_empty() {
            return Err(Error::validation("plan catalog defines no plans"));
        }
        Ok(Self::from_plans(file.plans))
    }

    /// Load a catalog file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "plan_catalog",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&yaml)
    }

    /// Look up a plan, failing validation for unknown names
    pub fn get(&self, name: &str) -> Result<&Plan> {
        self.plans.get(name).ok_or_else(|| {
            Error::validation_for_field(name, "plan", format!("unknown plan '{name}'"))
        })
    }

    /// Plan names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.plans.keys().map(String::as_str).collect()
    }
}
