// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # docsync
//!
//! A local-first document store that keeps working offline and converges
//! with a remote copy by continuous two-way replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                docsync                                   │
//! │                                                                          │
//! │  ┌─────────────┐   append   ┌────────────┐   ChangeFeed   ┌────────────┐ │
//! │  │ RecordStore │──────────► │ change log │──────────────► │ Replicator │ │
//! │  │ (SQLite)    │            │ (seq)      │                │ push/pull  │ │
//! │  └─────────────┘            └────────────┘                └────────────┘ │
//! │     ▲     │ revision trees                                  │       ▲    │
//! │     │     ▼                                                 ▼       │    │
//! │  ┌─────────────┐                                   ┌──────────────────┐  │
//! │  │  Resolver   │                                   │   HttpEndpoint   │  │
//! │  │ (winner)    │                                   │ (remote /db API) │  │
//! │  └─────────────┘                                   └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Every write creates a content-addressed revision (`generation-hash`) and
//!   appends one entry to the store's change log.
//! - The replicator reads each side's change feed, asks the other side which
//!   revisions it lacks, and transfers them with their ancestry.
//! - Divergent edits are kept as sibling leaves. Every store picks the same
//!   winner deterministically, and the losers remain queryable as conflicts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docsync::{RecordStore, Replicator, HttpEndpoint, ReplicaEndpoint};
//! use docsync::checkpoint::CheckpointStore;
//! use docsync::config::{SyncConfig, RemoteConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> docsync::Result<()> {
//! let config = SyncConfig::default();
//! let store = Arc::new(RecordStore::open("tablet-7", &config.store).await?);
//! let checkpoints = Arc::new(CheckpointStore::open(store.pool().clone()).await?);
//!
//! let remote = HttpEndpoint::new(&RemoteConfig::for_testing("http://hq:3000/db"))?;
//! let local: Arc<dyn ReplicaEndpoint> = store.clone();
//! let replicator = Replicator::new(local, Arc::new(remote), checkpoints, config.replication);
//! replicator.start().await?;
//!
//! // ... application writes into `store` ...
//!
//! replicator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod changes;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod orders;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod resolver;
pub mod revision;
pub mod server;
pub mod sqlite;
pub mod store;

// Re-exports for convenience
pub use changes::{ChangeFeed, FeedMode, FeedOptions};
pub use config::SyncConfig;
pub use endpoint::{ChangeEntry, ReplicaEndpoint, RevisionDoc};
pub use error::{Result, SyncError};
pub use orders::{OrderBook, SalesOrder};
pub use remote::{ConnectionState, HttpEndpoint};
pub use replicator::{Direction, ReplicationEvent, Replicator, ReplicatorState};
pub use revision::{Body, Revision};
pub use store::{Document, RecordStore};
