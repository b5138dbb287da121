// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-document revision tree.
//!
//! Append-only: nodes are added, never removed. Ancestors learned through
//! replication without a body are stubs. A tree loaded from disk is
//! validated first; any broken invariant surfaces as
//! [`SyncError::Corruption`] for that document alone.

use crate::error::{Result, SyncError};
use crate::revision::Revision;
use std::collections::{HashMap, HashSet};

/// One revision in a document's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevNode {
    pub rev: Revision,
    pub parent: Option<Revision>,
    pub deleted: bool,
    /// Known by marker only, no body held.
    pub stub: bool,
}

#[derive(Debug, Clone)]
pub struct RevisionTree {
    key: String,
    nodes: HashMap<Revision, RevNode>,
    /// Revisions that have at least one child.
    parents: HashSet<Revision>,
}

impl RevisionTree {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nodes: HashMap::new(),
            parents: HashSet::new(),
        }
    }

    /// Rebuild a tree from stored nodes and check its invariants.
    pub fn from_nodes(key: impl Into<String>, nodes: Vec<RevNode>) -> Result<Self> {
        let mut tree = Self::new(key);
        for node in nodes {
            if let Some(parent) = &node.parent {
                tree.parents.insert(parent.clone());
            }
            tree.nodes.insert(node.rev.clone(), node);
        }
        tree.validate()?;
        Ok(tree)
    }

    fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            match &node.parent {
                None if node.rev.generation() != 1 => {
                    return Err(SyncError::corruption(
                        &self.key,
                        format!("{} has no parent but is not generation 1", node.rev),
                    ));
                }
                None => {}
                Some(parent) => {
                    if !self.nodes.contains_key(parent) {
                        return Err(SyncError::corruption(
                            &self.key,
                            format!("{} points at missing parent {}", node.rev, parent),
                        ));
                    }
                    if parent.generation().checked_add(1) != Some(node.rev.generation()) {
                        return Err(SyncError::corruption(
                            &self.key,
                            format!("{} is not one generation after {}", node.rev, parent),
                        ));
                    }
                }
            }
            if node.stub && !self.parents.contains(&node.rev) {
                return Err(SyncError::corruption(
                    &self.key,
                    format!("leaf {} has no body", node.rev),
                ));
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, rev: &Revision) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn get(&self, rev: &Revision) -> Option<&RevNode> {
        self.nodes.get(rev)
    }

    /// Revisions with no children, highest first.
    pub fn leaves(&self) -> Vec<&RevNode> {
        let mut leaves: Vec<&RevNode> = self
            .nodes
            .values()
            .filter(|n| !self.parents.contains(&n.rev))
            .collect();
        leaves.sort_by(|a, b| b.rev.cmp(&a.rev));
        leaves
    }

    /// `rev` and its ancestors, back to the root.
    pub fn lineage(&self, rev: &Revision) -> Vec<Revision> {
        let mut lineage = Vec::new();
        let mut cursor = self.nodes.get(rev);
        while let Some(node) = cursor {
            lineage.push(node.rev.clone());
            cursor = node.parent.as_ref().and_then(|p| self.nodes.get(p));
        }
        lineage
    }

    /// Whether `ancestor` is `descendant` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> bool {
        if ancestor.generation() > descendant.generation() {
            return false;
        }
        let mut cursor = self.nodes.get(descendant);
        while let Some(node) = cursor {
            if &node.rev == ancestor {
                return true;
            }
            cursor = node.parent.as_ref().and_then(|p| self.nodes.get(p));
        }
        false
    }

    /// Nodes that adding `lineage` (newest first, validated) would create,
    /// root-most first. Known ancestors are skipped; unknown ones become stubs.
    ///
    /// Fails with `Corruption` when a known revision in the lineage has a
    /// different parent than the lineage claims.
    pub fn plan_lineage(&self, lineage: &[Revision], deleted: bool) -> Result<Vec<RevNode>> {
        let mut planned = Vec::new();
        for (i, rev) in lineage.iter().enumerate() {
            let parent = lineage.get(i + 1).cloned();
            if let Some(existing) = self.nodes.get(rev) {
                if existing.parent != parent {
                    return Err(SyncError::corruption(
                        &self.key,
                        format!(
                            "{} has parent {:?} locally but {:?} in the incoming lineage",
                            rev,
                            existing.parent.as_ref().map(|p| p.to_string()),
                            parent.as_ref().map(|p| p.to_string())
                        ),
                    ));
                }
                // Everything older is known too.
                break;
            }
            planned.push(RevNode {
                rev: rev.clone(),
                parent,
                deleted: i == 0 && deleted,
                stub: i != 0,
            });
        }
        planned.reverse();
        Ok(planned)
    }

    /// Add a node whose parent (if any) is already present.
    pub fn insert(&mut self, node: RevNode) -> Result<()> {
        if let Some(parent) = &node.parent {
            if !self.nodes.contains_key(parent) {
                return Err(SyncError::corruption(
                    &self.key,
                    format!("cannot add {}: parent {} unknown", node.rev, parent),
                ));
            }
            self.parents.insert(parent.clone());
        }
        self.nodes.insert(node.rev.clone(), node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> Revision {
        s.parse().unwrap()
    }

    fn node(r: &str, parent: Option<&str>, deleted: bool, stub: bool) -> RevNode {
        RevNode {
            rev: rev(r),
            parent: parent.map(rev),
            deleted,
            stub,
        }
    }

    /// 1-a ── 2-b ── 3-c
    ///    └── 2-d
    fn branched() -> RevisionTree {
        RevisionTree::from_nodes(
            "o1",
            vec![
                node("1-a", None, false, false),
                node("2-b", Some("1-a"), false, false),
                node("3-c", Some("2-b"), false, false),
                node("2-d", Some("1-a"), true, false),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_leaves_highest_first() {
        let tree = branched();
        let leaves: Vec<String> = tree.leaves().iter().map(|n| n.rev.to_string()).collect();
        assert_eq!(leaves, vec!["3-c", "2-d"]);
    }

    #[test]
    fn test_lineage_and_ancestry() {
        let tree = branched();
        assert_eq!(tree.lineage(&rev("3-c")), vec![rev("3-c"), rev("2-b"), rev("1-a")]);
        assert!(tree.is_ancestor(&rev("1-a"), &rev("3-c")));
        assert!(tree.is_ancestor(&rev("3-c"), &rev("3-c")));
        assert!(!tree.is_ancestor(&rev("2-d"), &rev("3-c")));
        assert!(tree.lineage(&rev("9-z")).is_empty());
    }

    #[test]
    fn test_missing_parent_is_corruption() {
        let err = RevisionTree::from_nodes("o1", vec![node("2-b", Some("1-a"), false, false)])
            .unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
    }

    #[test]
    fn test_parent_at_max_generation_is_corruption() {
        let err = RevisionTree::from_nodes(
            "o1",
            vec![
                node("18446744073709551615-b", None, false, false),
                node("1-c", Some("18446744073709551615-b"), false, false),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
    }

    #[test]
    fn test_generation_gap_is_corruption() {
        let err = RevisionTree::from_nodes(
            "o1",
            vec![node("1-a", None, false, false), node("3-c", Some("1-a"), false, false)],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
    }

    #[test]
    fn test_stub_leaf_is_corruption() {
        let err = RevisionTree::from_nodes("o1", vec![node("1-a", None, false, true)]).unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
    }

    #[test]
    fn test_plan_lineage_adds_stubs_root_first() {
        let tree = RevisionTree::from_nodes("o1", vec![node("1-a", None, false, false)]).unwrap();
        let planned = tree
            .plan_lineage(&[rev("3-c"), rev("2-b"), rev("1-a")], false)
            .unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0], node("2-b", Some("1-a"), false, true));
        assert_eq!(planned[1], node("3-c", Some("2-b"), false, false));
    }

    #[test]
    fn test_plan_lineage_on_empty_tree() {
        let tree = RevisionTree::new("o1");
        let planned = tree.plan_lineage(&[rev("2-b"), rev("1-a")], true).unwrap();
        assert_eq!(planned[0], node("1-a", None, false, true));
        assert_eq!(planned[1], node("2-b", Some("1-a"), true, false));
    }

    #[test]
    fn test_plan_lineage_known_revision_plans_nothing() {
        let tree = branched();
        assert!(tree.plan_lineage(&[rev("2-b"), rev("1-a")], false).unwrap().is_empty());
    }

    #[test]
    fn test_plan_lineage_parent_mismatch() {
        let tree = branched();
        let err = tree.plan_lineage(&[rev("2-b"), rev("1-x")], false).unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
    }

    #[test]
    fn test_insert_requires_parent() {
        let mut tree = RevisionTree::new("o1");
        assert!(tree.insert(node("2-b", Some("1-a"), false, false)).is_err());
        tree.insert(node("1-a", None, false, false)).unwrap();
        tree.insert(node("2-b", Some("1-a"), false, false)).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.leaves()[0].rev, rev("2-b"));
    }
}
