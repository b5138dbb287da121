// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed: ordered delivery of a store's change log.
//!
//! A feed is a background task that pages through [`ReplicaEndpoint::changes`]
//! and pushes entries into a bounded channel. The same feed works on a local
//! [`RecordStore`](crate::store::RecordStore) (waits on the store's seq
//! notification) and on an [`HttpEndpoint`](crate::remote::HttpEndpoint)
//! (waits via long-poll).
//!
//! ```text
//!   since ──▶ changes(since, batch) ──▶ entries ──▶ channel ──▶ listener
//!                 ▲                         │
//!                 │ empty page              ▼
//!                 └── wait_for_changes ◀── CaughtUp(seq)
//! ```
//!
//! Delivery is at-least-once. A listener that resumes from its own
//! bookkeeping can drop re-delivered entries with [`SeqFilter`].

use crate::endpoint::{ChangeEntry, ReplicaEndpoint};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Drain the backlog, then end.
    CatchUp,
    /// Keep waiting for new entries until cancelled.
    Continuous,
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Deliver entries with `seq > since`.
    pub since: u64,
    pub mode: FeedMode,
    /// Entries per page request; also bounds the channel.
    pub batch_size: usize,
    /// How long one wait for new entries may block (continuous mode).
    pub poll_timeout: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            since: 0,
            mode: FeedMode::Continuous,
            batch_size: 100,
            poll_timeout: Duration::from_secs(25),
        }
    }
}

impl FeedOptions {
    pub fn catch_up(since: u64) -> Self {
        Self {
            since,
            mode: FeedMode::CatchUp,
            ..Default::default()
        }
    }

    pub fn continuous(since: u64) -> Self {
        Self {
            since,
            mode: FeedMode::Continuous,
            ..Default::default()
        }
    }
}

/// What a feed delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Change(ChangeEntry),
    /// The backlog is drained up to this seq. Sent once per idle period.
    CaughtUp(u64),
}

/// Handle to a running feed. Dropping it cancels the task.
pub struct ChangeFeed {
    rx: mpsc::Receiver<Result<FeedItem>>,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    /// Start a feed on `source`.
    pub fn open(source: Arc<dyn ReplicaEndpoint>, options: FeedOptions) -> Self {
        let capacity = options.batch_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (cancel, cancel_rx) = watch::channel(false);

        let span = info_span!("change_feed", source = %source.id(), since = options.since);
        let handle = tokio::spawn(run_feed(source, options, tx, cancel_rx).instrument(span));

        Self {
            rx,
            cancel,
            handle: Some(handle),
        }
    }

    /// Next change entry, skipping `CaughtUp` markers.
    ///
    /// `None` when the feed has ended (caught up in `CatchUp` mode, cancelled,
    /// or after an error was delivered).
    pub async fn next(&mut self) -> Option<Result<ChangeEntry>> {
        loop {
            match self.rx.recv().await? {
                Ok(FeedItem::Change(entry)) => return Some(Ok(entry)),
                Ok(FeedItem::CaughtUp(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Next item including `CaughtUp` markers.
    pub async fn next_item(&mut self) -> Option<Result<FeedItem>> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next_item`](Self::next_item).
    pub fn try_next_item(&mut self) -> Option<Result<FeedItem>> {
        self.rx.try_recv().ok()
    }

    /// Stop the feed. Items already queued can still be received.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Cancel and wait for the feed task to exit.
    pub async fn close(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

async fn run_feed(
    source: Arc<dyn ReplicaEndpoint>,
    options: FeedOptions,
    tx: mpsc::Sender<Result<FeedItem>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut since = options.since;
    let batch_size = options.batch_size.max(1);
    let mut announced_idle = false;

    debug!(mode = ?options.mode, "Change feed started");

    loop {
        if *cancel_rx.borrow() {
            break;
        }

        let page = tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            page = source.changes(since, batch_size) => page,
        };

        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!(since, error = %e, "Change feed read failed");
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        let count = page.results.len();
        if count > 0 {
            announced_idle = false;
            for entry in page.results {
                since = entry.seq;
                if tx.send(Ok(FeedItem::Change(entry))).await.is_err() {
                    debug!("Change feed listener dropped");
                    return;
                }
            }
            crate::metrics::record_feed_delivered(source.id(), count);
            if count >= batch_size {
                continue;
            }
        }

        if !announced_idle {
            announced_idle = true;
            if tx.send(Ok(FeedItem::CaughtUp(since))).await.is_err() {
                return;
            }
        }

        if options.mode == FeedMode::CatchUp {
            break;
        }

        let waited = tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            seq = source.wait_for_changes(since, options.poll_timeout) => seq,
        };
        if let Err(e) = waited {
            warn!(since, error = %e, "Waiting for changes failed");
            let _ = tx.send(Err(e)).await;
            break;
        }
    }

    debug!(since, "Change feed stopped");
}

/// Drops entries at or below the highest seq already seen.
#[derive(Debug, Clone, Default)]
pub struct SeqFilter {
    last_seq: u64,
}

impl SeqFilter {
    pub fn new(last_seq: u64) -> Self {
        Self { last_seq }
    }

    /// `true` if `entry` is new; records it.
    pub fn accept(&mut self, entry: &ChangeEntry) -> bool {
        if entry.seq <= self.last_seq {
            return false;
        }
        self.last_seq = entry.seq;
        true
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}
