// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication direction: source feed → batch → target → checkpoint.
//!
//! Push and pull run the same loop with source and target swapped:
//! 1. Load the checkpoint for (source, target)
//! 2. Open a change feed on the source from the checkpoint
//! 3. Batch entries (key dedup), transfer missing revisions to the target
//! 4. Persist the checkpoint after each successful flush
//!
//! # Failure Handling
//!
//! Any error drops the feed and the pending batch, backs off (exponential,
//! jittered) and reopens the feed from the last persisted checkpoint.
//! Re-delivered entries are harmless: the target reports their revisions as
//! already present.
//!
//! # Graceful Shutdown
//!
//! The loop uses `tokio::select!` to respond immediately to shutdown, even
//! during a long-poll. On shutdown the pending batch is flushed and the
//! checkpoint persisted before the task exits.

use super::types::{Direction, DirectionSummary, ReplicationEvent};
use crate::batch::{BatchConfig, BatchProcessor};
use crate::changes::{ChangeFeed, FeedItem, FeedMode, FeedOptions};
use crate::checkpoint::{CheckpointStore, ReplicationId};
use crate::endpoint::ReplicaEndpoint;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything a direction task needs.
pub(crate) struct DirectionWorker {
    pub direction: Direction,
    pub source: Arc<dyn ReplicaEndpoint>,
    pub target: Arc<dyn ReplicaEndpoint>,
    pub checkpoints: Arc<CheckpointStore>,
    pub batch: BatchConfig,
    pub poll_timeout: Duration,
    pub retry: RetryConfig,
    pub events: broadcast::Sender<ReplicationEvent>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Why one feed session ended without error.
enum SessionEnd {
    /// Catch-up feed drained the source.
    Drained,
    /// Shutdown was signaled.
    Shutdown,
}

impl DirectionWorker {
    fn id(&self) -> ReplicationId {
        ReplicationId::new(self.source.id(), self.target.id())
    }

    fn publish(&self, event: ReplicationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run until the source is drained (`CatchUp`) or shutdown (`Continuous`).
    ///
    /// In `CatchUp` mode a non-retryable error, or running out of attempts,
    /// is returned. In `Continuous` mode every error is retried.
    pub async fn run(mut self, mode: FeedMode) -> Result<DirectionSummary> {
        let id = self.id();
        let span = info_span!(
            "replication",
            direction = %self.direction,
            source = %id.source,
            target = %id.target
        );

        async move {
            let start = self.checkpoints.get_or_start(&id).await;
            info!(checkpoint = start, mode = ?mode, "Starting replication direction");

            let mut summary = DirectionSummary::new(self.direction, start);
            let mut failures = 0usize;

            let outcome = loop {
                if *self.shutdown_rx.borrow() {
                    break Ok(());
                }

                let batches_before = summary.batches;
                match self.session(&id, mode, &mut summary).await {
                    Ok(SessionEnd::Drained) if mode == FeedMode::CatchUp => break Ok(()),
                    Ok(SessionEnd::Drained) => {
                        // Continuous feeds only end when cancelled; reopen.
                        debug!("Feed ended, reopening");
                        continue;
                    }
                    Ok(SessionEnd::Shutdown) => break Ok(()),
                    Err(e) => {
                        if summary.batches > batches_before {
                            failures = 0;
                        }
                        failures += 1;

                        let retryable = e.is_retryable();
                        metrics::record_replication_error(self.direction.as_str(), e.kind());
                        self.publish(ReplicationEvent::Error {
                            direction: self.direction,
                            message: e.to_string(),
                            retryable,
                        });

                        let give_up = mode == FeedMode::CatchUp
                            && (!retryable || !self.retry.should_retry(failures));
                        if give_up {
                            warn!(error = %e, failures, "Replication direction failed");
                            break Err(e);
                        }

                        let delay = self.retry.jittered_delay(failures);
                        warn!(
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Replication error, backing off"
                        );
                        summary.retries += 1;

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown_rx.changed() => {}
                        }
                    }
                }
            };

            summary.checkpoint = self.checkpoints.get_or_start(&id).await;
            self.publish(ReplicationEvent::Stopped {
                direction: self.direction,
            });
            info!(
                checkpoint = summary.checkpoint,
                batches = summary.batches,
                applied = summary.applied,
                "Replication direction stopped"
            );
            outcome.map(|()| summary)
        }
        .instrument(span)
        .await
    }

    /// Where the next session starts. A source whose log ends before the
    /// checkpoint has been recreated under the same identity, so its
    /// checkpoint is dropped and replication starts over from 0.
    async fn resume_point(&self, id: &ReplicationId) -> Result<u64> {
        let Some(checkpoint) = self.checkpoints.get(id).await else {
            return Ok(0);
        };
        let head = self.source.current_seq().await?;
        if head >= checkpoint {
            return Ok(checkpoint);
        }

        warn!(
            checkpoint,
            source_seq = head,
            "Source change log is behind the checkpoint, replicating from the start"
        );
        self.checkpoints.delete(id).await?;
        Ok(0)
    }

    /// One feed session: from the persisted checkpoint until drained,
    /// shutdown, or the first error.
    async fn session(
        &mut self,
        id: &ReplicationId,
        mode: FeedMode,
        summary: &mut DirectionSummary,
    ) -> Result<SessionEnd> {
        let since = self.resume_point(id).await?;
        let mut feed = ChangeFeed::open(
            Arc::clone(&self.source),
            FeedOptions {
                since,
                mode,
                batch_size: self.batch.max_batch_size,
                poll_timeout: self.poll_timeout,
            },
        );
        let mut batch = BatchProcessor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            self.direction.as_str(),
            self.batch.clone(),
        );

        debug!(since, "Feed opened");
        self.publish(ReplicationEvent::Active {
            direction: self.direction,
        });

        loop {
            let item = if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.changed() => None,
                    item = feed.next_item() => Some(item),
                }
            } else {
                let wait = batch.time_until_flush();
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.changed() => None,
                    item = tokio::time::timeout(wait, feed.next_item()) => match item {
                        Ok(item) => Some(item),
                        Err(_) => {
                            // Delay threshold hit while the source is slow.
                            self.flush(id, &mut batch, summary).await?;
                            continue;
                        }
                    },
                }
            };

            let Some(item) = item else {
                // A dropped sender counts as shutdown.
                if *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err() {
                    info!(pending = batch.len(), "Shutdown signal received, draining batch");
                    feed.cancel();
                    if !batch.is_empty() {
                        self.flush(id, &mut batch, summary).await?;
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                continue;
            };

            match item {
                Some(Ok(FeedItem::Change(entry))) => {
                    batch.add(entry);
                    if batch.should_flush() {
                        self.flush(id, &mut batch, summary).await?;
                    }
                }
                Some(Ok(FeedItem::CaughtUp(seq))) => {
                    if !batch.is_empty() {
                        self.flush(id, &mut batch, summary).await?;
                    }
                    debug!(source_seq = seq, "Caught up with source");
                    self.publish(ReplicationEvent::Paused {
                        direction: self.direction,
                        checkpoint: summary.checkpoint,
                    });
                }
                Some(Err(e)) => {
                    batch.discard();
                    return Err(e);
                }
                None => {
                    if !batch.is_empty() {
                        self.flush(id, &mut batch, summary).await?;
                    }
                    return Ok(SessionEnd::Drained);
                }
            }
        }
    }

    /// Transfer the batch, then persist the checkpoint.
    async fn flush(
        &self,
        id: &ReplicationId,
        batch: &mut BatchProcessor,
        summary: &mut DirectionSummary,
    ) -> Result<()> {
        let result = batch.flush().await?;
        if result.total == 0 {
            return Ok(());
        }

        let direction = self.direction.as_str();
        if let Err(e) = self.checkpoints.set(id, result.high_seq).await {
            metrics::record_checkpoint_persist(direction, false);
            return Err(e);
        }
        metrics::record_checkpoint_persist(direction, true);
        metrics::set_checkpoint_seq(direction, result.high_seq);

        summary.absorb(&result);
        self.publish(ReplicationEvent::Change {
            direction: self.direction,
            result,
            checkpoint: summary.checkpoint,
        });
        Ok(())
    }
}

/// Convert a task join failure into the crate error.
pub(crate) fn join_error(direction: Direction, e: tokio::task::JoinError) -> SyncError {
    SyncError::InvalidState {
        expected: format!("{} direction to complete", direction),
        actual: e.to_string(),
    }
}
