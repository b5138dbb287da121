// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bidirectional replicator between a local store and a remote endpoint.
//!
//! Ties together:
//! - Change feeds on both sides via [`crate::changes::ChangeFeed`]
//! - Batched transfer via [`crate::batch::BatchProcessor`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//!
//! # Architecture
//!
//! ```text
//!            push: local feed ──▶ batch ──▶ remote bulk_apply
//!  local ◀──────────────────────────────────────────────────▶ remote
//!            pull: remote feed ──▶ batch ──▶ local bulk_apply
//! ```
//!
//! The two directions are independent tasks with independent checkpoints.
//! Ping-pong cannot happen: a revision pushed to the remote shows up in the
//! remote's feed, gets pulled back, and the local store reports it as
//! already present without writing a change entry.
//!
//! # Modes
//!
//! - [`start()`](Replicator::start): live. Both directions tail their
//!   sources until [`shutdown()`](Replicator::shutdown); errors are retried
//!   forever with backoff.
//! - [`replicate_once()`](Replicator::replicate_once): one-shot. Both
//!   directions drain their sources and the per-direction summary is returned.

mod direction;
mod types;

pub use types::{
    Direction, DirectionSummary, ReplicationEvent, ReplicationSummary, ReplicatorState,
};

use crate::batch::BatchConfig;
use crate::changes::FeedMode;
use crate::checkpoint::{CheckpointStore, ReplicationId};
use crate::config::ReplicationSettings;
use crate::endpoint::ReplicaEndpoint;
use crate::error::{Result, SyncError};
use crate::metrics;
use direction::{join_error, DirectionWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the observer channel. Slow observers miss events (lagged).
const EVENT_CHANNEL_CAPACITY: usize = 256;

type DirectionHandle = (Direction, JoinHandle<Result<DirectionSummary>>);

pub struct Replicator {
    local: Arc<dyn ReplicaEndpoint>,
    remote: Arc<dyn ReplicaEndpoint>,
    checkpoints: Arc<CheckpointStore>,
    settings: ReplicationSettings,

    /// Replicator state (broadcast to watchers)
    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,

    events_tx: broadcast::Sender<ReplicationEvent>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Live direction tasks
    handles: Mutex<Vec<DirectionHandle>>,
}

impl Replicator {
    /// Create a replicator. Nothing runs until [`start`](Self::start) or
    /// [`replicate_once`](Self::replicate_once).
    pub fn new(
        local: Arc<dyn ReplicaEndpoint>,
        remote: Arc<dyn ReplicaEndpoint>,
        checkpoints: Arc<CheckpointStore>,
        settings: ReplicationSettings,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            local,
            remote,
            checkpoints,
            settings,
            state_tx,
            state_rx,
            events_tx,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Get current state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReplicatorState::Running)
    }

    /// Subscribe to replication events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events_tx.subscribe()
    }

    /// Checkpoint key of a direction.
    pub fn replication_id(&self, direction: Direction) -> ReplicationId {
        match direction {
            Direction::Push => ReplicationId::new(self.local.id(), self.remote.id()),
            Direction::Pull => ReplicationId::new(self.remote.id(), self.local.id()),
        }
    }

    /// Current checkpoint of a direction.
    pub async fn checkpoint(&self, direction: Direction) -> u64 {
        self.checkpoints
            .get_or_start(&self.replication_id(direction))
            .await
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_replicator_state(&state.to_string());
    }

    fn require_created(&self) -> Result<()> {
        let state = self.state();
        if state != ReplicatorState::Created {
            return Err(SyncError::InvalidState {
                expected: ReplicatorState::Created.to_string(),
                actual: state.to_string(),
            });
        }
        Ok(())
    }

    fn worker(&self, direction: Direction, live: bool) -> DirectionWorker {
        let (source, target) = match direction {
            Direction::Push => (Arc::clone(&self.local), Arc::clone(&self.remote)),
            Direction::Pull => (Arc::clone(&self.remote), Arc::clone(&self.local)),
        };
        DirectionWorker {
            direction,
            source,
            target,
            checkpoints: Arc::clone(&self.checkpoints),
            batch: BatchConfig {
                max_batch_size: self.settings.batch_size.max(1),
                max_concurrent_fetches: self.settings.max_concurrent_fetches.max(1),
                ..Default::default()
            },
            poll_timeout: self.settings.poll_timeout_duration(),
            retry: self.settings.retry.to_retry_config(live),
            events: self.events_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }

    /// Start live replication in both directions.
    pub async fn start(&self) -> Result<()> {
        self.require_created()?;

        info!(
            local = %self.local.id(),
            remote = %self.remote.id(),
            batch_size = self.settings.batch_size,
            "Starting live replication"
        );

        let mut handles = self.handles.lock().await;
        for direction in [Direction::Push, Direction::Pull] {
            let worker = self.worker(direction, true);
            handles.push((
                direction,
                tokio::spawn(worker.run(FeedMode::Continuous)),
            ));
            debug!(direction = %direction, "Spawned replication direction");
        }

        self.set_state(ReplicatorState::Running);
        Ok(())
    }

    /// Run both directions until each has drained its source.
    ///
    /// Transient failures are retried up to the configured attempts; other
    /// failures are returned immediately. Either direction failing fails the
    /// pass, but the other direction still runs to completion first.
    pub async fn replicate_once(&self) -> Result<ReplicationSummary> {
        self.require_created()?;

        let push = self.worker(Direction::Push, false).run(FeedMode::CatchUp);
        let pull = self.worker(Direction::Pull, false).run(FeedMode::CatchUp);
        let (push, pull) = tokio::join!(push, pull);

        let summary = ReplicationSummary {
            push: push?,
            pull: pull?,
        };
        info!(
            pushed = summary.push.applied,
            pulled = summary.pull.applied,
            push_checkpoint = summary.push.checkpoint,
            pull_checkpoint = summary.pull.checkpoint,
            "One-shot replication complete"
        );
        Ok(summary)
    }

    /// Stop live replication gracefully.
    ///
    /// 1. Signal both directions to stop
    /// 2. Wait for them to flush pending batches and persist checkpoints
    ///    (bounded by `shutdown_timeout`)
    pub async fn shutdown(&self) {
        if matches!(self.state(), ReplicatorState::Stopped | ReplicatorState::ShuttingDown) {
            return;
        }

        info!("Shutting down replicator");
        self.set_state(ReplicatorState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<DirectionHandle> = std::mem::take(&mut *self.handles.lock().await);
        let drain_timeout: Duration = self.settings.shutdown_timeout_duration();

        for (direction, handle) in handles {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(Ok(summary))) => {
                    debug!(
                        direction = %direction,
                        checkpoint = summary.checkpoint,
                        "Direction completed gracefully"
                    );
                }
                Ok(Ok(Err(e))) => {
                    warn!(direction = %direction, error = %e, "Direction exited with error");
                }
                Ok(Err(e)) => {
                    let e = join_error(direction, e);
                    warn!(direction = %direction, error = %e, "Direction task panicked during shutdown");
                }
                Err(_) => {
                    warn!(
                        direction = %direction,
                        "Direction timed out during shutdown (batch may be re-sent on restart)"
                    );
                }
            }
        }

        self.set_state(ReplicatorState::Stopped);
        info!("Replicator stopped");
    }
}
