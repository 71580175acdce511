//! Dedicated node reservation planning
//!
//! A node is reserved for a workspace when it carries the reserved-pool label
//! with the workspace id and the matching `NoSchedule` taint. Planning is pure:
//! it compares the host's nodes with the desired config and says which nodes to
//! label and which to give back.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Node, Taint};

use kaas_common::model::DedicatedNodeConfig;
use kaas_common::naming::{DEDICATED_POOL_LABEL, DEDICATED_TAINT_KEY, INSTANCE_TYPE_LABEL};
use kaas_common::{Error, Result};

/// Nodes to reserve and release to reach a desired config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePlan {
    /// Nodes that must be labelled and tainted for the workspace
    pub reserve: Vec<String>,
    /// Reserved nodes that are no longer wanted
    pub release: Vec<String>,
    /// Reserved nodes that already satisfy the config
    pub keep: Vec<String>,
}

impl NodePlan {
    /// Whether nothing needs to change
    pub fn is_noop(&self) -> bool {
        self.reserve.is_empty() && self.release.is_empty()
    }
}

fn node_name(node: &Node) -> Option<&str> {
    node.metadata.name.as_deref()
}

fn label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Workspace a node is reserved for, if any
pub fn reservation_owner(node: &Node) -> Option<&str> {
    label(node, DEDICATED_POOL_LABEL)
}

fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

fn matches_config(node: &Node, config: &DedicatedNodeConfig) -> bool {
    label(node, INSTANCE_TYPE_LABEL) == Some(config.instance_class.as_str())
        && config
            .node_selector
            .iter()
            .all(|(k, v)| label(node, k) == Some(v.as_str()))
}

/// Work out which nodes to reserve and release for `workspace_id`.
///
/// Nodes already reserved for the workspace that still match are kept first;
/// free schedulable nodes fill the rest in name order. Fails with a retryable
/// error when the host does not have enough free matching nodes.
pub fn plan_nodes(
    nodes: &[Node],
    workspace_id: &str,
    desired: Option<&DedicatedNodeConfig>,
) -> Result<NodePlan> {
    let mut plan = NodePlan::default();
    let mut owned: Vec<&Node> = nodes
        .iter()
        .filter(|n| reservation_owner(n) == Some(workspace_id))
        .collect();
    owned.sort_by(|a, b| node_name(a).cmp(&node_name(b)));

    let Some(config) = desired else {
        plan.release = owned
            .iter()
            .filter_map(|n| node_name(n).map(str::to_string))
            .collect();
        return Ok(plan);
    };

    let wanted = config.count as usize;
    for node in owned {
        let Some(name) = node_name(node) else { continue };
        if plan.keep.len() < wanted && matches_config(node, config) {
            plan.keep.push(name.to_string());
        } else {
            plan.release.push(name.to_string());
        }
    }

    let mut free: Vec<&str> = nodes
        .iter()
        .filter(|n| reservation_owner(n).is_none() && is_schedulable(n) && matches_config(n, config))
        .filter_map(node_name)
        .collect();
    free.sort_unstable();

    let missing = wanted - plan.keep.len();
    if free.len() < missing {
        return Err(Error::provision(
            workspace_id,
            format!(
                "need {missing} more free {} node(s), host has {}",
                config.instance_class,
                free.len()
            ),
        ));
    }
    plan.reserve = free
        .into_iter()
        .take(missing)
        .map(str::to_string)
        .collect();
    Ok(plan)
}

/// The reserved-pool taint for a workspace
pub fn pool_taint(workspace_id: &str) -> Taint {
    Taint {
        key: DEDICATED_TAINT_KEY.to_string(),
        value: Some(workspace_id.to_string()),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

fn current_taints(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

/// Full taint list for a node being reserved
///
/// Existing unrelated taints are preserved; the pool taint and the config's
/// extra taints replace any previous entries with the same key.
pub fn reserved_taints(node: &Node, workspace_id: &str, config: &DedicatedNodeConfig) -> Vec<Taint> {
    let mut ours = vec![pool_taint(workspace_id)];
    ours.extend(config.taints.iter().map(|t| Taint {
        key: t.key.clone(),
        value: t.value.clone(),
        effect: t.effect.as_str().to_string(),
        ..Default::default()
    }));
    let keys: BTreeSet<&str> = ours.iter().map(|t| t.key.as_str()).collect();

    let mut taints: Vec<Taint> = current_taints(node)
        .into_iter()
        .filter(|t| !keys.contains(t.key.as_str()))
        .collect();
    taints.extend(ours);
    taints
}

/// Taint list for a node being released
///
/// Drops the pool taint plus any extra taint keys the previous config added.
pub fn released_taints(node: &Node, extra_keys: &[String]) -> Vec<Taint> {
    current_taints(node)
        .into_iter()
        .filter(|t| t.key != DEDICATED_TAINT_KEY && !extra_keys.contains(&t.key))
        .collect()
}
