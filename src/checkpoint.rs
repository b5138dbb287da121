// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication directions.
//!
//! Stores, per (source, target) pair, the highest source seq whose batch has
//! been fully applied to the target. Lives in the local store's SQLite file so
//! it survives restarts together with the data it describes.
//!
//! # Checkpoint Semantics
//!
//! The checkpoint is written **after** the target accepted the batch:
//!
//! ```text
//! read changes 41..50 → bulk_apply on target → persist checkpoint 50
//!                       (crash here = re-read 41..50, already_present)
//! ```
//!
//! Writes go straight to disk (no debouncing). A batch flush is already a
//! network round-trip, so one extra small SQLite write per batch is noise.

use crate::error::Result;
use crate::sqlite::execute_with_retry;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identifies one replication direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicationId {
    pub source: String,
    pub target: String,
}

impl ReplicationId {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for ReplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.source, self.target)
    }
}

/// Persisted checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub id: ReplicationId,
    pub seq: u64,
    /// Unix millis of the last update.
    pub updated_at: i64,
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: RwLock<HashMap<ReplicationId, u64>>,
}

impl CheckpointStore {
    /// Create the checkpoint table in `pool` (if needed) and load it.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                seq INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (source, target)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT source, target, seq FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (source, target, seq) in rows {
            debug!(source = %source, target = %target, seq, "Loaded checkpoint from disk");
            cache.insert(ReplicationId::new(source, target), seq as u64);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
        })
    }

    /// The checkpoint for a direction, if one was ever written.
    pub async fn get(&self, id: &ReplicationId) -> Option<u64> {
        self.cache.read().await.get(id).copied()
    }

    /// The checkpoint, or 0 for a first-time replication.
    pub async fn get_or_start(&self, id: &ReplicationId) -> u64 {
        self.get(id).await.unwrap_or(0)
    }

    /// Persist a checkpoint. The cache is only updated once the row is on disk.
    pub async fn set(&self, id: &ReplicationId, seq: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        execute_with_retry("checkpoint_set", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (source, target, seq, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(source, target) DO UPDATE SET
                    seq = excluded.seq,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id.source)
            .bind(&id.target)
            .bind(seq as i64)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await?;

        self.cache.write().await.insert(id.clone(), seq);
        debug!(replication = %id, seq, "Checkpoint persisted");
        Ok(())
    }

    /// Forget a direction (next run replicates from the start).
    pub async fn delete(&self, id: &ReplicationId) -> Result<()> {
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE source = ? AND target = ?")
                .bind(&id.source)
                .bind(&id.target)
                .execute(&self.pool)
                .await
        })
        .await?;

        self.cache.write().await.remove(id);
        info!(replication = %id, "Checkpoint deleted");
        Ok(())
    }

    /// All persisted checkpoints (for diagnostics).
    pub async fn get_all(&self) -> Result<Vec<CheckpointEntry>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT source, target, seq, updated_at FROM checkpoints ORDER BY source, target",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source, target, seq, updated_at)| CheckpointEntry {
                id: ReplicationId::new(source, target),
                seq: seq as u64,
                updated_at,
            })
            .collect())
    }
}
