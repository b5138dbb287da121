// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication between two stores: convergence, conflict retention, and
//! recovery from an unavailable target.
//!
//! Run with: cargo test --test replication
//!
//! # Test Organization
//! - `replicate_*` - one-shot passes between two local stores
//! - `conflict_*` - divergent edits and deterministic winners
//! - `resilience_*` - failure injection with `FlakyEndpoint`

mod common;

use common::{body, one_shot, sync_once, FlakyEndpoint, TestStore};
use docsync::config::ReplicationSettings;
use docsync::{Direction, ReplicaEndpoint, Replicator, ReplicatorState, SyncError};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` until it returns true or the deadline passes.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

// =============================================================================
// One-shot replication
// =============================================================================

#[tokio::test]
async fn replicate_order_to_remote() {
    let local = TestStore::new("local").await;
    let remote = TestStore::new("remote").await;

    let order = body(json!({"orderId": "SO100", "quantity": 5}));
    local
        .store
        .put("2024-01-01T00:00:00Z", order, None)
        .await
        .unwrap();

    sync_once(&local, &remote).await;

    let doc = remote.store.get("2024-01-01T00:00:00Z", None).await.unwrap();
    assert_eq!(doc.body["quantity"], 5);
    assert_eq!(doc.body["orderId"], "SO100");
    assert_eq!(doc.rev.generation(), 1);
}

#[tokio::test]
async fn replicate_both_directions_converges() {
    let a = TestStore::new("a").await;
    let b = TestStore::new("b").await;

    for i in 0..15 {
        a.store
            .put(&format!("a{:02}", i), body(json!({"from": "a", "i": i})), None)
            .await
            .unwrap();
    }
    for i in 0..7 {
        b.store
            .put(&format!("b{:02}", i), body(json!({"from": "b", "i": i})), None)
            .await
            .unwrap();
    }

    sync_once(&a, &b).await;

    let a_info = a.store.info().await.unwrap();
    let b_info = b.store.info().await.unwrap();
    assert_eq!(a_info.doc_count, 22);
    assert_eq!(b_info.doc_count, 22);
    for key in ["a00", "a14", "b00", "b06"] {
        let on_a = a.store.get(key, None).await.unwrap();
        let on_b = b.store.get(key, None).await.unwrap();
        assert_eq!(on_a, on_b);
    }
}

#[tokio::test]
async fn replicate_again_transfers_nothing() {
    let a = TestStore::new("a").await;
    let b = TestStore::new("b").await;
    a.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    b.store.put("o2", body(json!({"q": 2})), None).await.unwrap();

    sync_once(&a, &b).await;
    let a_seq = a.store.update_seq();
    let b_seq = b.store.update_seq();

    let summary = one_shot(&a, b.endpoint())
        .await
        .replicate_once()
        .await
        .unwrap();
    assert_eq!(summary.applied(), 0);
    assert_eq!(a.store.update_seq(), a_seq);
    assert_eq!(b.store.update_seq(), b_seq);
}

#[tokio::test]
async fn replicate_deletion() {
    let a = TestStore::new("a").await;
    let b = TestStore::new("b").await;
    let r1 = a.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    sync_once(&a, &b).await;
    assert!(b.store.get("o1", None).await.is_ok());

    a.store.delete("o1", &r1).await.unwrap();
    sync_once(&a, &b).await;

    assert!(matches!(
        b.store.get("o1", None).await.unwrap_err(),
        SyncError::NotFound { .. }
    ));
    assert_eq!(b.store.info().await.unwrap().doc_count, 0);
}

#[tokio::test]
async fn replicate_from_recreated_remote_starts_over() {
    let local = TestStore::new("local").await;
    let remote = TestStore::new("remote").await;
    for i in 0..3 {
        remote
            .store
            .put(&format!("old{}", i), body(json!({"i": i})), None)
            .await
            .unwrap();
    }
    sync_once(&local, &remote).await;
    let replicator = one_shot(&local, remote.endpoint()).await;
    assert_eq!(replicator.checkpoint(Direction::Pull).await, 3);

    // Same identity, fresh log.
    let recreated = TestStore::new("remote").await;
    recreated
        .store
        .put("fresh", body(json!({"q": 1})), None)
        .await
        .unwrap();

    let summary = one_shot(&local, recreated.endpoint())
        .await
        .replicate_once()
        .await
        .unwrap();
    assert_eq!(summary.pull.applied, 1);
    assert_eq!(summary.pull.checkpoint, 1);
    assert_eq!(local.store.get("fresh", None).await.unwrap().body["q"], 1);
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn conflict_same_winner_and_loser_on_both_sides() {
    let a = TestStore::new("a").await;
    let b = TestStore::new("b").await;

    let r1 = a.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    sync_once(&a, &b).await;

    let on_a = a.store.put("o1", body(json!({"q": 10})), Some(&r1)).await.unwrap();
    let on_b = b.store.put("o1", body(json!({"q": 20})), Some(&r1)).await.unwrap();
    assert_ne!(on_a, on_b);

    sync_once(&a, &b).await;

    let info_a = a.store.revision_info("o1").await.unwrap();
    let info_b = b.store.revision_info("o1").await.unwrap();
    assert_eq!(info_a.rev, info_b.rev);

    let winner = std::cmp::max(on_a.clone(), on_b.clone());
    let loser = std::cmp::min(on_a, on_b);
    assert_eq!(info_a.rev, winner);
    assert_eq!(a.store.list_conflicts("o1").await.unwrap(), vec![loser.clone()]);
    assert_eq!(b.store.list_conflicts("o1").await.unwrap(), vec![loser.clone()]);

    // The losing body is still readable on the side that never wrote it.
    let loser_on_a = a.store.get("o1", Some(&loser)).await.unwrap();
    let loser_on_b = b.store.get("o1", Some(&loser)).await.unwrap();
    assert_eq!(loser_on_a.body, loser_on_b.body);
}

#[tokio::test]
async fn conflict_resolved_by_writing_on_winner() {
    let a = TestStore::new("a").await;
    let b = TestStore::new("b").await;

    let r1 = a.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    sync_once(&a, &b).await;
    a.store.put("o1", body(json!({"q": 10})), Some(&r1)).await.unwrap();
    b.store.put("o1", body(json!({"q": 20})), Some(&r1)).await.unwrap();
    sync_once(&a, &b).await;

    // An edit on top of the winner becomes current on both sides.
    let winner = a.store.revision_info("o1").await.unwrap().rev;
    let merged = a
        .store
        .put("o1", body(json!({"q": 30})), Some(&winner))
        .await
        .unwrap();
    sync_once(&a, &b).await;

    assert_eq!(b.store.get("o1", None).await.unwrap().rev, merged);
    assert_eq!(b.store.get("o1", None).await.unwrap().body["q"], 30);
}

// =============================================================================
// Resilience
// =============================================================================

#[tokio::test]
async fn resilience_checkpoint_holds_while_target_is_down() {
    let local = TestStore::new("local").await;
    let remote = TestStore::new("remote").await;
    let flaky = FlakyEndpoint::new(remote.endpoint());

    local.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    local.store.put("o2", body(json!({"q": 2})), None).await.unwrap();

    flaky.set_fail_writes(true);
    let replicator = one_shot(&local, flaky.clone()).await;
    let err = replicator.replicate_once().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(flaky.bulk_calls.load(Ordering::SeqCst) > 0);
    assert_eq!(replicator.checkpoint(Direction::Push).await, 0);
    assert_eq!(remote.store.update_seq(), 0);

    flaky.set_fail_writes(false);
    let summary = one_shot(&local, flaky.clone())
        .await
        .replicate_once()
        .await
        .unwrap();
    assert_eq!(summary.push.applied, 2);
    assert_eq!(summary.push.checkpoint, 2);

    // Re-delivered batch applied exactly once.
    assert_eq!(flaky.applied_docs.load(Ordering::SeqCst), 2);
    assert_eq!(remote.store.update_seq(), 2);
    assert_eq!(remote.store.get("o2", None).await.unwrap().body["q"], 2);
}

#[tokio::test]
async fn resilience_live_replication_recovers_after_outage() {
    let local = TestStore::new("local").await;
    let remote = TestStore::new("remote").await;
    let flaky = FlakyEndpoint::new(remote.endpoint());
    flaky.set_fail_writes(true);

    let remote_endpoint: Arc<dyn ReplicaEndpoint> = flaky.clone();
    let replicator = Replicator::new(
        local.endpoint(),
        remote_endpoint,
        local.checkpoints().await,
        ReplicationSettings::for_testing(),
    );
    replicator.start().await.unwrap();
    assert_eq!(replicator.state(), ReplicatorState::Running);

    local.store.put("o1", body(json!({"q": 1})), None).await.unwrap();
    let probe = flaky.clone();
    eventually("a failed push attempt", || {
        let probe = probe.clone();
        async move { probe.bulk_calls.load(Ordering::SeqCst) > 0 }
    })
    .await;
    assert_eq!(replicator.checkpoint(Direction::Push).await, 0);

    flaky.set_fail_writes(false);
    let remote_store = remote.store.clone();
    eventually("remote to receive o1", || {
        let remote_store = remote_store.clone();
        async move { remote_store.get("o1", None).await.is_ok() }
    })
    .await;

    // Edits on the remote flow back while running.
    let rev = remote.store.get("o1", None).await.unwrap().rev;
    remote
        .store
        .put("o1", body(json!({"q": 2})), Some(&rev))
        .await
        .unwrap();
    let local_store = local.store.clone();
    eventually("local to pull the remote edit", || {
        let local_store = local_store.clone();
        async move {
            match local_store.get("o1", None).await {
                Ok(doc) => doc.body["q"] == 2,
                Err(_) => false,
            }
        }
    })
    .await;

    replicator.shutdown().await;
    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert!(replicator.checkpoint(Direction::Push).await >= 1);
}
