// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision resolver: deterministic winner selection among leaves.
//!
//! Every replica runs the same rule over the same set of leaves, so they
//! agree on the current revision without talking to each other:
//!
//! 1. Higher generation wins.
//! 2. On a tie, the lexicographically higher hash wins.
//!
//! Tombstones compete like any other leaf. A deleted branch that is longer
//! than a live one keeps the document deleted; the live loser stays readable
//! and shows up in `list_conflicts`.

use crate::endpoint::ApplyStatus;
use crate::revision::Revision;
use crate::store::tree::{RevNode, RevisionTree};

/// The outcome of resolving a document's leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Revision,
    pub deleted: bool,
    /// Non-winning, non-deleted leaves, highest first.
    pub conflicts: Vec<Revision>,
}

/// Pick the winning leaf.
pub fn pick_winner<'a, I>(leaves: I) -> Option<&'a RevNode>
where
    I: IntoIterator<Item = &'a RevNode>,
{
    leaves.into_iter().max_by(|a, b| a.rev.cmp(&b.rev))
}

/// Resolve a document. `None` for an empty tree.
pub fn resolve(tree: &RevisionTree) -> Option<Resolution> {
    let leaves = tree.leaves();
    let winner = pick_winner(leaves.iter().copied())?;
    let conflicts = leaves
        .iter()
        .filter(|leaf| leaf.rev != winner.rev && !leaf.deleted)
        .map(|leaf| leaf.rev.clone())
        .collect();

    Some(Resolution {
        winner: winner.rev.clone(),
        deleted: winner.deleted,
        conflicts,
    })
}

/// Classify an incoming revision against the tree as it was before applying.
///
/// `lineage` is the incoming revision followed by its ancestors.
pub fn classify(before: &RevisionTree, lineage: &[Revision]) -> ApplyStatus {
    let Some(incoming) = lineage.first() else {
        return ApplyStatus::AlreadyPresent;
    };
    if before.contains(incoming) {
        return ApplyStatus::AlreadyPresent;
    }
    match resolve(before) {
        None => ApplyStatus::Created,
        Some(current) if lineage.contains(&current.winner) => ApplyStatus::FastForward,
        Some(_) => ApplyStatus::Conflict,
    }
}
