// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator state, events and summaries.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ───────────→ Running
//!    │                    │
//!    │ shutdown()         │ shutdown()
//!    ↓                    ↓
//! Stopped ←──────── ShuttingDown
//! ```
//!
//! - **Created**: after `Replicator::new()`. One-shot passes run from here.
//! - **Running**: both directions tailing their source feeds.
//! - **ShuttingDown**: draining in-flight batches, persisting checkpoints.
//! - **Stopped**: both directions exited. Safe to drop.

use crate::batch::BatchResult;
use std::fmt;

/// Lifecycle state of a [`Replicator`](super::Replicator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorState::Created => write!(f, "Created"),
            ReplicatorState::Running => write!(f, "Running"),
            ReplicatorState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Which way documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local store → remote.
    Push,
    /// Remote → local store.
    Pull,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published to observers as replication progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A direction opened its feed and is transferring.
    Active { direction: Direction },
    /// A batch was transferred and the checkpoint advanced.
    Change {
        direction: Direction,
        result: BatchResult,
        checkpoint: u64,
    },
    /// A direction drained its source and is waiting for new changes.
    Paused { direction: Direction, checkpoint: u64 },
    /// A direction failed; it backs off and resumes from its checkpoint
    /// unless the pass is one-shot and the error is not retryable.
    Error {
        direction: Direction,
        message: String,
        retryable: bool,
    },
    /// A direction exited.
    Stopped { direction: Direction },
}

impl ReplicationEvent {
    pub fn direction(&self) -> Direction {
        match self {
            ReplicationEvent::Active { direction }
            | ReplicationEvent::Change { direction, .. }
            | ReplicationEvent::Paused { direction, .. }
            | ReplicationEvent::Error { direction, .. }
            | ReplicationEvent::Stopped { direction } => *direction,
        }
    }
}

/// Totals for one direction of a replication pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionSummary {
    pub direction: Direction,
    pub batches: usize,
    pub keys: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub corrupt: usize,
    pub rejected: usize,
    /// Checkpoint when the direction stopped.
    pub checkpoint: u64,
    /// Failed attempts that were retried.
    pub retries: usize,
}

impl DirectionSummary {
    pub fn new(direction: Direction, checkpoint: u64) -> Self {
        Self {
            direction,
            batches: 0,
            keys: 0,
            applied: 0,
            skipped: 0,
            conflicts: 0,
            corrupt: 0,
            rejected: 0,
            checkpoint,
            retries: 0,
        }
    }

    pub fn absorb(&mut self, result: &BatchResult) {
        self.batches += 1;
        self.keys += result.total;
        self.applied += result.applied;
        self.skipped += result.skipped;
        self.conflicts += result.conflicts;
        self.corrupt += result.corrupt;
        self.rejected += result.rejected;
        self.checkpoint = self.checkpoint.max(result.high_seq);
    }
}

/// Result of a one-shot replication pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSummary {
    pub push: DirectionSummary,
    pub pull: DirectionSummary,
}

impl ReplicationSummary {
    /// Revisions added on either side.
    pub fn applied(&self) -> usize {
        self.push.applied + self.pull.applied
    }
}
