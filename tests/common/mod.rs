// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for the integration tests.
//!
//! This module provides:
//! - Temporary SQLite-backed stores
//! - `FlakyEndpoint`, a failure-injecting wrapper around any endpoint
//! - Body and replication helpers

#![allow(dead_code)]

use docsync::checkpoint::CheckpointStore;
use docsync::config::{ReplicationSettings, StoreConfig};
use docsync::endpoint::{
    ApplyOutcome, BoxFuture, ChangesPage, RevisionDoc, RevsDiffRequest, RevsDiffResponse,
};
use docsync::{Body, RecordStore, ReplicaEndpoint, Replicator, SyncError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A store in its own temp directory. Keep the `TempDir` alive for the test.
pub struct TestStore {
    pub dir: TempDir,
    pub store: Arc<RecordStore>,
}

impl TestStore {
    pub async fn new(id: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(format!("{}.db", id));
        let config = StoreConfig::for_testing(path.to_str().expect("utf-8 path"));
        let store = RecordStore::open(id, &config).await.expect("open store");
        Self {
            dir,
            store: Arc::new(store),
        }
    }

    pub fn endpoint(&self) -> Arc<dyn ReplicaEndpoint> {
        self.store.clone()
    }

    pub async fn checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::new(
            CheckpointStore::open(self.store.pool().clone())
                .await
                .expect("checkpoint store"),
        )
    }
}

/// Build a body from a `json!` object literal.
pub fn body(value: Value) -> Body {
    match value {
        Value::Object(map) => map,
        other => panic!("body must be an object, got {}", other),
    }
}

/// A fresh one-shot replicator between two stores.
pub async fn one_shot(local: &TestStore, remote: Arc<dyn ReplicaEndpoint>) -> Replicator {
    Replicator::new(
        local.endpoint(),
        remote,
        local.checkpoints().await,
        ReplicationSettings::for_testing(),
    )
}

/// Replicate both ways once with a fresh replicator.
pub async fn sync_once(a: &TestStore, b: &TestStore) {
    one_shot(a, b.endpoint())
        .await
        .replicate_once()
        .await
        .expect("replication pass");
}

/// Wraps an endpoint and fails writes (and optionally reads) on demand, the
/// way an unreachable remote would.
pub struct FlakyEndpoint {
    inner: Arc<dyn ReplicaEndpoint>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    pub bulk_calls: AtomicUsize,
    pub applied_docs: AtomicUsize,
}

impl FlakyEndpoint {
    pub fn new(inner: Arc<dyn ReplicaEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            bulk_calls: AtomicUsize::new(0),
            applied_docs: AtomicUsize::new(0),
        })
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), SyncError> {
        if flag.load(Ordering::SeqCst) {
            Err(SyncError::transient(self.inner.id(), "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl ReplicaEndpoint for FlakyEndpoint {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn current_seq(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.check(&self.fail_reads)?;
            self.inner.current_seq().await
        })
    }

    fn changes(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        Box::pin(async move {
            self.check(&self.fail_reads)?;
            self.inner.changes(since, limit).await
        })
    }

    fn wait_for_changes(&self, since: u64, timeout: Duration) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.check(&self.fail_reads)?;
            self.inner.wait_for_changes(since, timeout).await
        })
    }

    fn revs_diff(&self, request: RevsDiffRequest) -> BoxFuture<'_, RevsDiffResponse> {
        Box::pin(async move {
            self.check(&self.fail_reads)?;
            self.inner.revs_diff(request).await
        })
    }

    fn leaf_revisions(&self, key: &str) -> BoxFuture<'_, Vec<RevisionDoc>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check(&self.fail_reads)?;
            self.inner.leaf_revisions(&key).await
        })
    }

    fn bulk_apply(&self, docs: Vec<RevisionDoc>) -> BoxFuture<'_, Vec<ApplyOutcome>> {
        Box::pin(async move {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            self.check(&self.fail_writes)?;
            let outcomes = self.inner.bulk_apply(docs).await?;
            let applied = outcomes
                .iter()
                .filter(|o| o.status.map(|s| s.adds_revision()).unwrap_or(false))
                .count();
            self.applied_docs.fetch_add(applied, Ordering::SeqCst);
            Ok(outcomes)
        })
    }
}
