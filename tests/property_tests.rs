// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs:
//! revision markers order consistently, winner selection ignores leaf order,
//! and any interleaving of edits converges after replication.

mod common;

use common::{body, sync_once, TestStore};
use docsync::resolver::pick_winner;
use docsync::store::tree::RevNode;
use docsync::Revision;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;

fn revision_strategy() -> impl Strategy<Value = Revision> {
    (1u64..50, "[0-9a-f]{32}").prop_map(|(generation, hash)| {
        format!("{}-{}", generation, hash).parse().unwrap()
    })
}

// =============================================================================
// Revision Ordering Properties
// =============================================================================

proptest! {
    /// Display then parse yields the same marker.
    #[test]
    fn revision_display_parse_roundtrip(rev in revision_strategy()) {
        let reparsed: Revision = rev.to_string().parse().unwrap();
        prop_assert_eq!(reparsed, rev);
    }

    /// Generation dominates the ordering, hash breaks ties.
    #[test]
    fn revision_ordering_generation_first(a in revision_strategy(), b in revision_strategy()) {
        if a.generation() != b.generation() {
            prop_assert_eq!(a.cmp(&b), a.generation().cmp(&b.generation()));
        } else {
            prop_assert_eq!(a.cmp(&b), a.hash().cmp(b.hash()));
        }
        prop_assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
    }

    /// A child is always ordered after its parent.
    #[test]
    fn revision_child_sorts_after_parent(parent in revision_strategy(), q in 0i64..1000, deleted in any::<bool>()) {
        let child = Revision::compute(Some(&parent), deleted, &body(json!({"q": q}))).unwrap();
        prop_assert_eq!(child.generation(), parent.generation() + 1);
        prop_assert!(child > parent);
    }

    /// The winner does not depend on the order leaves are presented in.
    #[test]
    fn winner_independent_of_leaf_order(
        revs in prop::collection::btree_set(revision_strategy(), 1..8),
        deleted in prop::collection::vec(any::<bool>(), 8),
    ) {
        let nodes: Vec<RevNode> = revs
            .iter()
            .zip(deleted)
            .map(|(rev, deleted)| RevNode {
                rev: rev.clone(),
                parent: None,
                deleted,
                stub: false,
            })
            .collect();

        let forward = pick_winner(nodes.iter()).map(|n| n.rev.clone());
        let backward = pick_winner(nodes.iter().rev()).map(|n| n.rev.clone());
        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(forward.as_ref(), revs.iter().next_back());
    }
}

// =============================================================================
// Convergence
// =============================================================================

/// One step of a two-store scenario.
#[derive(Debug, Clone)]
enum Step {
    /// Edit `key` on store A (`true`) or B (`false`).
    Edit { on_a: bool, key: u8, value: i64 },
    /// Replicate both ways once.
    Sync,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (any::<bool>(), 0u8..3, 0i64..100)
            .prop_map(|(on_a, key, value)| Step::Edit { on_a, key, value }),
        1 => Just(Step::Sync),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any interleaving of edits and partial syncs ends with identical
    /// current revisions and leaf sets on both stores.
    #[test]
    fn replication_converges(steps in prop::collection::vec(step_strategy(), 1..12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let a = TestStore::new("a").await;
            let b = TestStore::new("b").await;
            let mut keys = BTreeSet::new();

            for step in &steps {
                match step {
                    Step::Edit { on_a, key, value } => {
                        let key = format!("k{}", key);
                        let target = if *on_a { &a } else { &b };
                        target
                            .store
                            .put(&key, body(json!({"value": value})), None)
                            .await
                            .unwrap();
                        keys.insert(key);
                    }
                    Step::Sync => sync_once(&a, &b).await,
                }
            }
            sync_once(&a, &b).await;

            for key in &keys {
                let info_a = a.store.revision_info(key).await.unwrap();
                let info_b = b.store.revision_info(key).await.unwrap();
                assert_eq!(info_a, info_b, "diverged on {}", key);
                assert_eq!(
                    a.store.list_conflicts(key).await.unwrap(),
                    b.store.list_conflicts(key).await.unwrap()
                );
            }
        });
    }
}
