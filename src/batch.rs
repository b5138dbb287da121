// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch processor for change entries.
//!
//! Collects entries from a source feed with key deduplication (latest wins)
//! and transfers the affected documents to the target in one round-trip.
//!
//! # Design
//!
//! ```text
//! ChangeEntry ──▶ BatchProcessor ──┬──▶ Debounce (time/count)
//!                                  │
//!                HashMap<key, seq> │
//!                (latest wins)     ▼
//!                        Parallel leaf_revisions() on source
//!                                  │
//!                                  ▼
//!                        revs_diff() on target (what's missing?)
//!                                  │
//!                                  ▼
//!                        bulk_apply() missing revisions on target
//! ```
//!
//! Every leaf of a key travels, not only the winner, so conflicting branches
//! reach the target and both sides resolve the same winner.

use crate::endpoint::{ChangeEntry, ReplicaEndpoint, RevisionDoc, RevsDiffRequest};
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Configuration for batch processing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum distinct keys before forcing a flush.
    pub max_batch_size: usize,
    /// Maximum time to wait before flushing.
    pub max_batch_delay: Duration,
    /// Maximum concurrent leaf fetches from the source.
    pub max_concurrent_fetches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(50),
            max_concurrent_fetches: 8,
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(5),
            max_concurrent_fetches: 4,
        }
    }
}

/// Result of processing a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Distinct keys in the batch (after dedup).
    pub total: usize,
    /// Leaf revisions fetched from the source.
    pub revisions: usize,
    /// Revisions the target added.
    pub applied: usize,
    /// Revisions the target already had.
    pub skipped: usize,
    /// Applied revisions that diverged from the target's current one.
    pub conflicts: usize,
    /// Documents skipped because their history is corrupt (either side).
    pub corrupt: usize,
    /// Revisions the target rejected for other per-document reasons.
    pub rejected: usize,
    /// Highest source seq covered by this batch.
    pub high_seq: u64,
}

impl BatchResult {
    /// Check if every document transferred cleanly.
    pub fn is_success(&self) -> bool {
        self.corrupt == 0 && self.rejected == 0
    }
}

/// Accumulates change entries and flushes them from source to target.
pub struct BatchProcessor {
    /// Pending keys with the latest seq seen for each.
    pending: HashMap<String, u64>,
    /// Entries added since the last flush, before dedup.
    received: usize,
    high_seq: u64,
    /// When the current batch started accumulating.
    batch_start: Option<Instant>,
    config: BatchConfig,
    source: Arc<dyn ReplicaEndpoint>,
    target: Arc<dyn ReplicaEndpoint>,
    /// Direction label (for logging and metrics).
    direction: String,
}

impl BatchProcessor {
    pub fn new(
        source: Arc<dyn ReplicaEndpoint>,
        target: Arc<dyn ReplicaEndpoint>,
        direction: impl Into<String>,
        config: BatchConfig,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            received: 0,
            high_seq: 0,
            batch_start: None,
            config,
            source,
            target,
            direction: direction.into(),
        }
    }

    /// Add a change entry to the batch.
    ///
    /// Multiple entries for the same key collapse into one: the flush reads
    /// the key's leaves as they are at flush time anyway.
    pub fn add(&mut self, entry: ChangeEntry) {
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        self.received += 1;
        self.high_seq = self.high_seq.max(entry.seq);

        let seq = self.pending.entry(entry.key).or_insert(entry.seq);
        *seq = (*seq).max(entry.seq);
    }

    /// Check if the batch should be flushed.
    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.config.max_batch_size {
            return true;
        }

        if let Some(start) = self.batch_start {
            if start.elapsed() >= self.config.max_batch_delay {
                return true;
            }
        }

        false
    }

    /// Time left before the delay threshold forces a flush.
    pub fn time_until_flush(&self) -> Duration {
        match self.batch_start {
            Some(start) => self.config.max_batch_delay.saturating_sub(start.elapsed()),
            None => self.config.max_batch_delay,
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest seq added since the last flush.
    pub fn high_seq(&self) -> u64 {
        self.high_seq
    }

    /// Drop pending entries without transferring them (the caller will
    /// re-read them from its checkpoint).
    pub fn discard(&mut self) {
        self.pending.clear();
        self.received = 0;
        self.high_seq = 0;
        self.batch_start = None;
    }

    /// Transfer the batch to the target.
    ///
    /// 1. Parallel leaf fetches from the source
    /// 2. `revs_diff` on the target
    /// 3. `bulk_apply` of the missing revisions
    ///
    /// An `Err` means nothing can be assumed about the target; the batch is
    /// dropped and the caller must not advance its checkpoint.
    #[instrument(skip(self), fields(direction = %self.direction, keys = self.pending.len()))]
    pub async fn flush(&mut self) -> Result<BatchResult> {
        if self.pending.is_empty() {
            return Ok(BatchResult::default());
        }

        let started = Instant::now();
        let batch = std::mem::take(&mut self.pending);
        let received = std::mem::take(&mut self.received);
        let high_seq = std::mem::take(&mut self.high_seq);
        self.batch_start = None;

        crate::metrics::record_batch_dedup(&self.direction, received, batch.len());

        let mut result = BatchResult {
            total: batch.len(),
            high_seq,
            ..Default::default()
        };

        debug!(
            direction = %self.direction,
            batch_size = result.total,
            high_seq,
            "Flushing batch"
        );

        // Phase 1: leaves from the source
        let docs = self.fetch_leaves(batch.into_keys().collect(), &mut result).await?;
        result.revisions = docs.len();
        if docs.is_empty() {
            self.record(&result, started);
            return Ok(result);
        }

        // Phase 2: what does the target lack?
        let mut request = RevsDiffRequest::new();
        for doc in &docs {
            request.entry(doc.key.clone()).or_default().push(doc.rev.clone());
        }
        let diff = self.target.revs_diff(request).await?;

        let missing: Vec<RevisionDoc> = docs
            .into_iter()
            .filter(|doc| {
                diff.get(&doc.key)
                    .map(|entry| entry.missing.contains(&doc.rev))
                    .unwrap_or(false)
            })
            .collect();
        result.skipped = result.revisions - missing.len();

        // Phase 3: apply
        if !missing.is_empty() {
            let outcomes = self.target.bulk_apply(missing).await?;
            for outcome in outcomes {
                match (outcome.status, outcome.error) {
                    (Some(status), _) => {
                        if status.adds_revision() {
                            result.applied += 1;
                        } else {
                            result.skipped += 1;
                        }
                        if status == crate::endpoint::ApplyStatus::Conflict {
                            result.conflicts += 1;
                        }
                    }
                    (None, Some(failure)) if failure.kind == "corruption" => {
                        warn!(
                            direction = %self.direction,
                            key = %outcome.key,
                            rev = %outcome.rev,
                            reason = %failure.reason,
                            "Target reports corrupt history, skipping document"
                        );
                        crate::metrics::record_corrupt_document(&self.direction);
                        result.corrupt += 1;
                    }
                    (None, failure) => {
                        warn!(
                            direction = %self.direction,
                            key = %outcome.key,
                            rev = %outcome.rev,
                            reason = ?failure.map(|f| f.reason),
                            "Target rejected revision"
                        );
                        result.rejected += 1;
                    }
                }
            }
        }

        self.record(&result, started);
        Ok(result)
    }

    /// Fetch every leaf of `keys` from the source, bounded by a semaphore.
    async fn fetch_leaves(
        &self,
        keys: Vec<String>,
        result: &mut BatchResult,
    ) -> Result<Vec<RevisionDoc>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1)));
        let mut join_set: JoinSet<(String, Result<Vec<RevisionDoc>>)> = JoinSet::new();

        for key in keys {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let leaves = source.leaf_revisions(&key).await;
                (key, leaves)
            });
        }

        let mut docs = Vec::new();
        let mut first_error: Option<SyncError> = None;

        while let Some(joined) = join_set.join_next().await {
            let (key, leaves) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Leaf fetch task failed (JoinError)");
                    first_error.get_or_insert(SyncError::InvalidState {
                        expected: "leaf fetch to complete".to_string(),
                        actual: e.to_string(),
                    });
                    continue;
                }
            };

            match leaves {
                Ok(leaves) => docs.extend(leaves),
                Err(SyncError::Corruption { key, message }) => {
                    warn!(
                        direction = %self.direction,
                        key = %key,
                        reason = %message,
                        "Source history corrupt, skipping document"
                    );
                    crate::metrics::record_corrupt_document(&self.direction);
                    result.corrupt += 1;
                }
                Err(SyncError::NotFound { .. }) => {
                    // Listed in the change log, so it existed; nothing to send.
                    debug!(key = %key, "Key vanished from source before fetch");
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                docs.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.rev.cmp(&b.rev)));
                Ok(docs)
            }
        }
    }

    fn record(&self, result: &BatchResult, started: Instant) {
        crate::metrics::record_batch_flush(
            &self.direction,
            result.total,
            result.applied,
            result.skipped,
            result.conflicts,
            result.corrupt,
            started.elapsed(),
        );

        info!(
            direction = %self.direction,
            total = result.total,
            revisions = result.revisions,
            applied = result.applied,
            skipped = result.skipped,
            conflicts = result.conflicts,
            corrupt = result.corrupt,
            rejected = result.rejected,
            high_seq = result.high_seq,
            "Batch flush complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::revision::Body;
    use crate::store::RecordStore;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn store(dir: &TempDir, name: &str) -> Arc<RecordStore> {
        let path = dir.path().join(format!("{}.db", name));
        Arc::new(
            RecordStore::open(name, &StoreConfig::for_testing(path.to_str().unwrap()))
                .await
                .unwrap(),
        )
    }

    fn body(n: i64) -> Body {
        json!({ "n": n }).as_object().cloned().unwrap()
    }

    fn processor(source: &Arc<RecordStore>, target: &Arc<RecordStore>) -> BatchProcessor {
        BatchProcessor::new(
            Arc::clone(source) as Arc<dyn ReplicaEndpoint>,
            Arc::clone(target) as Arc<dyn ReplicaEndpoint>,
            "push",
            BatchConfig::testing(),
        )
    }

    async fn entries(store: &RecordStore) -> Vec<ChangeEntry> {
        store.changes_page(0, 1000).await.unwrap().results
    }

    #[tokio::test]
    async fn test_batch_key_deduplication() {
        let dir = tempdir().unwrap();
        let (source, target) = (store(&dir, "src").await, store(&dir, "dst").await);

        for n in 0..3 {
            source.put("o1", body(n), None).await.unwrap();
        }

        let mut batch = processor(&source, &target);
        for entry in entries(&source).await {
            batch.add(entry);
        }
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.high_seq(), 3);

        let result = batch.flush().await.unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.applied, 1);
        assert_eq!(result.high_seq, 3);
        assert_eq!(target.get("o1", None).await.unwrap().body["n"], 2);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_second_flush_skips_present_revisions() {
        let dir = tempdir().unwrap();
        let (source, target) = (store(&dir, "src").await, store(&dir, "dst").await);
        source.put("a", body(1), None).await.unwrap();
        source.put("b", body(2), None).await.unwrap();

        let mut batch = processor(&source, &target);
        for entry in entries(&source).await {
            batch.add(entry);
        }
        assert_eq!(batch.flush().await.unwrap().applied, 2);

        for entry in entries(&source).await {
            batch.add(entry);
        }
        let again = batch.flush().await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(target.update_seq(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_branches_all_travel() {
        let dir = tempdir().unwrap();
        let (a, b, c) = (
            store(&dir, "a").await,
            store(&dir, "b").await,
            store(&dir, "c").await,
        );

        // Build a conflict on `a`, then push it to an empty `c`.
        a.put("o1", body(0), None).await.unwrap();
        b.apply_revisions(a.leaf_revisions("o1").await.unwrap()).await.unwrap();
        a.put("o1", body(1), None).await.unwrap();
        b.put("o1", body(2), None).await.unwrap();
        a.apply_revisions(b.leaf_revisions("o1").await.unwrap()).await.unwrap();

        let mut batch = processor(&a, &c);
        for entry in entries(&a).await {
            batch.add(entry);
        }
        let result = batch.flush().await.unwrap();
        assert_eq!(result.revisions, 2);
        assert_eq!(result.applied, 2);
        assert_eq!(result.conflicts, 1);

        assert_eq!(
            c.revision_info("o1").await.unwrap(),
            a.revision_info("o1").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_source_document_is_skipped() {
        let dir = tempdir().unwrap();
        let (source, target) = (store(&dir, "src").await, store(&dir, "dst").await);
        source.put("good", body(1), None).await.unwrap();
        sqlx::query("INSERT INTO revisions (key, rev, parent, deleted, body) VALUES ('bad', '2-bb', '1-aa', 0, x'7b7d')")
            .execute(source.pool())
            .await
            .unwrap();

        let mut batch = processor(&source, &target);
        batch.add(ChangeEntry {
            seq: 1,
            key: "good".into(),
            rev: source.get("good", None).await.unwrap().rev,
            deleted: false,
        });
        batch.add(ChangeEntry {
            seq: 2,
            key: "bad".into(),
            rev: "2-bb".parse().unwrap(),
            deleted: false,
        });

        let result = batch.flush().await.unwrap();
        assert_eq!(result.corrupt, 1);
        assert_eq!(result.applied, 1);
        assert_eq!(result.high_seq, 2);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_should_flush_by_size_and_time() {
        let dir = tempdir().unwrap();
        let (source, target) = (store(&dir, "src").await, store(&dir, "dst").await);
        let mut batch = BatchProcessor::new(
            source as Arc<dyn ReplicaEndpoint>,
            target as Arc<dyn ReplicaEndpoint>,
            "pull",
            BatchConfig {
                max_batch_size: 2,
                max_batch_delay: Duration::from_millis(20),
                max_concurrent_fetches: 1,
            },
        );
        let entry = |seq, key: &str| ChangeEntry {
            seq,
            key: key.into(),
            rev: "1-aa".parse().unwrap(),
            deleted: false,
        };

        assert!(!batch.should_flush());
        batch.add(entry(1, "a"));
        assert!(!batch.should_flush());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(batch.should_flush());
        assert_eq!(batch.time_until_flush(), Duration::ZERO);

        batch.discard();
        assert!(batch.is_empty());
        batch.add(entry(2, "a"));
        batch.add(entry(3, "b"));
        assert!(batch.should_flush());
    }

    #[tokio::test]
    async fn test_empty_flush() {
        let dir = tempdir().unwrap();
        let (source, target) = (store(&dir, "src").await, store(&dir, "dst").await);
        let result = processor(&source, &target).flush().await.unwrap();
        assert_eq!(result, BatchResult::default());
        assert!(result.is_success());
    }

    #[test]
    fn test_batch_config_testing() {
        let config = BatchConfig::testing();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.max_batch_delay, Duration::from_millis(5));
        assert_eq!(config.max_concurrent_fetches, 4);
    }
}
