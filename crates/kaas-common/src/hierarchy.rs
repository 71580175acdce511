//! Iterative traversal over flat parent-pointer trees
//!
//! Projects and groups are both stored as `(id, parent_id)` rows. These
//! helpers walk them without recursion and refuse to go deeper than
//! [`MAX_HIERARCHY_DEPTH`], so a corrupted row can never loop forever.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{Error, Result};

/// Deepest tree the control plane will walk
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// Parent pointers for every node of one workspace's tree
#[derive(Clone, Debug, Default)]
pub struct ParentMap {
    parents: HashMap<String, Option<String>>,
}

impl ParentMap {
    /// Build from `(id, parent_id)` rows
    pub fn from_rows(rows: impl IntoIterator<Item = (String, Option<String>)>) -> Self {
        Self {
            parents: rows.into_iter().collect(),
        }
    }

    /// Whether the node exists in this tree
    pub fn contains(&self, id: &str) -> bool {
        self.parents.contains_key(id)
    }

    /// Parent of a node (`None` for roots and unknown ids)
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parents.get(id).and_then(|p| p.as_deref())
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself
    ///
    /// Fails if the chain revisits a node or exceeds the depth guard.
    pub fn ancestors(&self, id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id.to_string()]);
        let mut current = self.parent_of(id);

        while let Some(parent) = current {
            if !seen.insert(parent.to_string()) {
                return Err(Error::validation_for(
                    id,
                    format!("hierarchy cycle detected at {parent}"),
                ));
            }
            if chain.len() >= MAX_HIERARCHY_DEPTH {
                return Err(Error::validation_for(
                    id,
                    format!("hierarchy deeper than {MAX_HIERARCHY_DEPTH} levels"),
                ));
            }
            chain.push(parent.to_string());
            current = self.parent_of(parent);
        }

        Ok(chain)
    }

    /// Whether making `new_parent` the parent of `id` would close a loop
    ///
    /// True when `new_parent` is `id` itself or one of its descendants.
    pub fn would_create_cycle(&self, id: &str, new_parent: &str) -> Result<bool> {
        if id == new_parent {
            return Ok(true);
        }
        Ok(self.ancestors(new_parent)?.iter().any(|a| a == id))
    }

    /// Depth of a node (roots are depth 0)
    pub fn depth(&self, id: &str) -> Result<usize> {
        Ok(self.ancestors(id)?.len())
    }

    /// Ids of direct children of `id`
    pub fn children_of(&self, id: &str) -> Vec<String> {
        let mut children: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, parent)| parent.as_deref() == Some(id))
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    /// Close a set of direct memberships over their ancestors
    ///
    /// Shared ancestors appear once. Ids not present in the map are skipped.
    pub fn flatten<'a>(&self, direct: impl IntoIterator<Item = &'a str>) -> Result<BTreeSet<String>> {
        let mut all = BTreeSet::new();
        for id in direct {
            if !self.contains(id) {
                continue;
            }
            if !all.insert(id.to_string()) {
                continue;
            }
            for ancestor in self.ancestors(id)? {
                all.insert(ancestor);
            }
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(rows: &[(&str, Option<&str>)]) -> ParentMap {
        ParentMap::from_rows(
            rows.iter()
                .map(|(id, parent)| (id.to_string(), parent.map(String::from))),
        )
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let t = tree(&[("g1", None), ("g2", Some("g1")), ("g3", Some("g2"))]);
        assert_eq!(
            t.ancestors("g3").ok(),
            Some(vec!["g2".to_string(), "g1".to_string()])
        );
        assert_eq!(t.depth("g1").ok(), Some(0));
    }

    #[test]
    fn test_flatten_includes_every_ancestor_once() {
        // G1 <- G2 <- G3, user directly in G3
        let t = tree(&[("G1", None), ("G2", Some("G1")), ("G3", Some("G2"))]);
        let groups = t.flatten(["G3"]).ok();
        assert_eq!(
            groups,
            Some(BTreeSet::from([
                "G1".to_string(),
                "G2".to_string(),
                "G3".to_string()
            ]))
        );
    }

    #[test]
    fn test_flatten_dedups_shared_ancestors() {
        let t = tree(&[
            ("root", None),
            ("eng", Some("root")),
            ("backend", Some("eng")),
            ("frontend", Some("eng")),
        ]);
        let groups = t.flatten(["backend", "frontend"]).ok().unwrap_or_default();
        assert_eq!(groups.len(), 4);
        assert_eq!(groups.iter().filter(|g| *g == "eng").count(), 1);
    }

    #[test]
    fn test_cycle_detection_on_reparent() {
        let t = tree(&[("a", None), ("b", Some("a")), ("c", Some("b"))]);
        assert_eq!(t.would_create_cycle("a", "c").ok(), Some(true));
        assert_eq!(t.would_create_cycle("a", "a").ok(), Some(true));
        assert_eq!(t.would_create_cycle("c", "a").ok(), Some(false));
    }

    #[test]
    fn test_corrupt_cycle_is_an_error_not_a_hang() {
        let t = tree(&[("a", Some("b")), ("b", Some("a"))]);
        assert!(t.ancestors("a").is_err());
        assert!(t.flatten(["a"]).is_err());
    }

    #[test]
    fn test_depth_guard() {
        let mut rows = vec![("n0".to_string(), None)];
        for i in 1..=(MAX_HIERARCHY_DEPTH + 1) {
            rows.push((format!("n{i}"), Some(format!("n{}", i - 1))));
        }
        let t = ParentMap::from_rows(rows);
        assert!(t.ancestors(&format!("n{}", MAX_HIERARCHY_DEPTH)).is_ok());
        assert!(t.ancestors(&format!("n{}", MAX_HIERARCHY_DEPTH + 1)).is_err());
    }

    #[test]
    fn test_children_of() {
        let t = tree(&[("p", None), ("c1", Some("p")), ("c2", Some("p")), ("x", None)]);
        assert_eq!(t.children_of("p"), vec!["c1".to_string(), "c2".to_string()]);
        assert!(t.children_of("c1").is_empty());
    }
}
