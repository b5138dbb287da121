// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The record store: durable documents with revision history and a change log.
//!
//! # Tables
//!
//! ```text
//! revisions  (key, rev) → parent, deleted, body (NULL for stubs)
//! documents  key → winning rev, deleted, seq of last change
//! changes    seq → key, rev, deleted   (append-only, gapless)
//! ```
//!
//! # Write Path
//!
//! ```text
//! put/create/delete/apply_revision
//!   │
//!   ├─ lock document (per-key async mutex)
//!   ├─ load + validate revision tree
//!   ├─ build revision: hash, resolve winner, encode/compress body
//!   └─ write gate ─▶ one transaction:
//!                     INSERT revisions, UPSERT documents, INSERT changes(MAX+1)
//!                   ─▶ notify feed waiters with the new seq
//! ```
//!
//! The write gate is held only for the commit, so hashing and compression
//! for different documents run concurrently while the sequence stays gapless.
//! Reads go straight to the pool; WAL gives each one a consistent snapshot.

pub mod locks;
pub mod tree;

use crate::changes::{ChangeFeed, FeedOptions};
use crate::codec;
use crate::config::StoreConfig;
use crate::endpoint::{
    ApplyOutcome, ApplyStatus, BoxFuture, ChangeEntry, ChangesPage, ReplicaEndpoint,
    RevisionDoc, RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
};
use crate::error::{Result, SyncError};
use crate::resolver::{self, Resolution};
use crate::revision::{validate_lineage, Body, Revision};
use crate::sqlite;
use futures::stream::{self, BoxStream, StreamExt};
use locks::DocumentLocks;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use tree::{RevNode, RevisionTree};

/// Entries fetched per query by the lazy streams.
const STREAM_PAGE_SIZE: usize = 200;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS revisions (
        key TEXT NOT NULL,
        rev TEXT NOT NULL,
        parent TEXT,
        deleted INTEGER NOT NULL DEFAULT 0,
        body BLOB,
        PRIMARY KEY (key, rev)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        key TEXT PRIMARY KEY,
        rev TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        seq INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS changes (
        seq INTEGER PRIMARY KEY,
        key TEXT NOT NULL,
        rev TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_live ON documents (deleted, key)",
];

/// A document at one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub rev: Revision,
    pub deleted: bool,
    pub body: Body,
}

impl Document {
    /// Body with `_id`, `_rev` (and `_deleted` for tombstones) merged in.
    pub fn to_json(&self) -> Value {
        let mut map = self.body.clone();
        map.insert("_id".into(), Value::String(self.key.clone()));
        map.insert("_rev".into(), Value::String(self.rev.to_string()));
        if self.deleted {
            map.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

/// One row of [`RecordStore::all_documents`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub key: String,
    pub rev: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

/// Revision metadata of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub key: String,
    pub rev: Revision,
    pub deleted: bool,
    pub leaves: Vec<Revision>,
    pub conflicts: Vec<Revision>,
}

/// Store-level summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub node_id: String,
    pub update_seq: u64,
    pub doc_count: u64,
}

/// Everything a mutation writes, computed before taking the write gate.
struct PendingCommit {
    key: String,
    nodes: Vec<(RevNode, Option<Vec<u8>>)>,
    winner: Revision,
    deleted: bool,
}

/// Durable key → document storage with revision trees and a change log.
pub struct RecordStore {
    id: String,
    pool: SqlitePool,
    path: String,
    compression_threshold: usize,
    locks: DocumentLocks,
    write_gate: Mutex<()>,
    seq_tx: watch::Sender<u64>,
}

impl RecordStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(id: impl Into<String>, config: &StoreConfig) -> Result<Self> {
        let id = id.into();
        info!(node_id = %id, path = %config.sqlite_path, "Opening record store");

        let pool = sqlite::open_pool(&config.sqlite_path, config.max_connections).await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let (update_seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM changes")
            .fetch_one(&pool)
            .await?;
        if update_seq > 0 {
            info!(update_seq, "Restored change log from previous run");
        }

        let (seq_tx, _) = watch::channel(update_seq as u64);

        Ok(Self {
            id,
            pool,
            path: config.sqlite_path.clone(),
            compression_threshold: config.compression_threshold,
            locks: DocumentLocks::new(),
            write_gate: Mutex::new(()),
            seq_tx,
        })
    }

    /// This store's identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The underlying pool, shared with the checkpoint store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Highest sequence number written so far (0 for an empty store).
    pub fn update_seq(&self) -> u64 {
        *self.seq_tx.borrow()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write `body` as a new revision of `key`.
    ///
    /// With `expected_rev` the write is optimistic: it fails with `Conflict`
    /// unless that is the current revision. Without it the new revision is a
    /// child of whatever is current (or a root for a new key).
    #[instrument(skip(self, body, expected_rev), fields(expected = ?expected_rev.map(|r| r.to_string())))]
    pub async fn put(&self, key: &str, body: Body, expected_rev: Option<&Revision>) -> Result<Revision> {
        let started = Instant::now();
        validate_key(key)?;

        let _doc = self.locks.lock(key).await;
        let tree = self.load_tree(key).await?;
        let current = resolver::resolve(&tree);
        check_expected(key, expected_rev, current.as_ref())?;

        let parent = current.map(|c| c.winner);
        let rev = self.write_local(key, tree, parent, false, &body).await?;
        crate::metrics::record_write("put", started.elapsed());
        Ok(rev)
    }

    /// Like `put`, but fails with `Conflict` when a live document already
    /// exists under `key`. Writing over a deleted document is allowed.
    #[instrument(skip(self, body))]
    pub async fn create(&self, key: &str, body: Body) -> Result<Revision> {
        let started = Instant::now();
        validate_key(key)?;

        let _doc = self.locks.lock(key).await;
        let tree = self.load_tree(key).await?;
        let parent = match resolver::resolve(&tree) {
            Some(current) if !current.deleted => {
                return Err(SyncError::Conflict {
                    key: key.to_string(),
                    expected: "none".to_string(),
                    current: Some(current.winner.to_string()),
                });
            }
            Some(tombstone) => Some(tombstone.winner),
            None => None,
        };

        let rev = self.write_local(key, tree, parent, false, &body).await?;
        crate::metrics::record_write("create", started.elapsed());
        Ok(rev)
    }

    /// Write a tombstone child of `expected_rev`.
    ///
    /// Fails `NotFound` for unknown or already deleted documents and
    /// `Conflict` when `expected_rev` is not current.
    #[instrument(skip(self, expected_rev), fields(expected = %expected_rev))]
    pub async fn delete(&self, key: &str, expected_rev: &Revision) -> Result<Revision> {
        let started = Instant::now();
        validate_key(key)?;

        let _doc = self.locks.lock(key).await;
        let tree = self.load_tree(key).await?;
        let current = match resolver::resolve(&tree) {
            Some(current) if !current.deleted => current,
            _ => return Err(SyncError::not_found(key)),
        };
        check_expected(key, Some(expected_rev), Some(&current))?;

        let rev = self
            .write_local(key, tree, Some(current.winner), true, &Body::new())
            .await?;
        crate::metrics::record_write("delete", started.elapsed());
        Ok(rev)
    }

    async fn write_local(
        &self,
        key: &str,
        mut tree: RevisionTree,
        parent: Option<Revision>,
        deleted: bool,
        body: &Body,
    ) -> Result<Revision> {
        let rev = Revision::compute(parent.as_ref(), deleted, body)?;
        if tree.contains(&rev) {
            debug!(key, rev = %rev, "Identical revision already stored");
            return Ok(rev);
        }

        let node = RevNode {
            rev: rev.clone(),
            parent,
            deleted,
            stub: false,
        };
        tree.insert(node.clone())?;
        let resolution = resolved(&tree)?;
        let encoded = codec::encode_body(body, self.compression_threshold)?;

        let seq = self
            .commit(PendingCommit {
                key: key.to_string(),
                nodes: vec![(node, Some(encoded))],
                winner: resolution.winner,
                deleted: resolution.deleted,
            })
            .await?;

        debug!(key, rev = %rev, seq, deleted, "Local write committed");
        Ok(rev)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replicated writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a revision received from another store.
    ///
    /// Unknown ancestors in the lineage are stored as stubs. Re-applying a
    /// revision already held is a no-op and writes no change entry.
    #[instrument(skip(self, doc), fields(key = %doc.key, rev = %doc.rev))]
    pub async fn apply_revision(&self, doc: RevisionDoc) -> Result<ApplyStatus> {
        validate_key(&doc.key)?;
        if doc.revisions.first() != Some(&doc.rev) {
            return Err(SyncError::InvalidRevision(format!(
                "lineage of {} does not start with it",
                doc.rev
            )));
        }
        validate_lineage(&doc.revisions)?;
        if !doc.deleted && doc.body.is_none() {
            return Err(SyncError::InvalidRevision(format!(
                "{} is live but carries no body",
                doc.rev
            )));
        }

        let _doc = self.locks.lock(&doc.key).await;
        let mut tree = self.load_tree(&doc.key).await?;

        let status = resolver::classify(&tree, &doc.revisions);
        if status == ApplyStatus::AlreadyPresent {
            crate::metrics::record_revision_applied(status.as_str());
            return Ok(status);
        }

        let planned = tree.plan_lineage(&doc.revisions, doc.deleted)?;
        let body = doc.body.unwrap_or_default();
        let mut encoded = Some(codec::encode_body(&body, self.compression_threshold)?);

        let mut nodes = Vec::with_capacity(planned.len());
        for node in planned {
            tree.insert(node.clone())?;
            let blob = if node.stub { None } else { encoded.take() };
            nodes.push((node, blob));
        }
        let resolution = resolved(&tree)?;

        let seq = self
            .commit(PendingCommit {
                key: doc.key.clone(),
                nodes,
                winner: resolution.winner.clone(),
                deleted: resolution.deleted,
            })
            .await?;

        crate::metrics::record_revision_applied(status.as_str());
        if status == ApplyStatus::Conflict {
            info!(
                key = %doc.key,
                winner = %resolution.winner,
                conflicts = resolution.conflicts.len(),
                "Divergent revision applied, winner resolved"
            );
        }
        debug!(key = %doc.key, status = %status, seq, "Replicated revision applied");
        Ok(status)
    }

    /// Apply a batch of replicated revisions in order.
    ///
    /// Per-document problems (corrupt history, malformed lineage) become
    /// failed outcomes; storage errors abort the whole call.
    pub async fn apply_revisions(&self, docs: Vec<RevisionDoc>) -> Result<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = doc.key.clone();
            let rev = doc.rev.clone();
            match self.apply_revision(doc).await {
                Ok(status) => outcomes.push(ApplyOutcome::applied(key, rev, status)),
                Err(e @ (SyncError::Corruption { .. }
                | SyncError::InvalidRevision(_)
                | SyncError::InvalidKey(_)
                | SyncError::Encoding(_))) => {
                    warn!(key = %key, rev = %rev, error = %e, "Rejected replicated revision");
                    outcomes.push(ApplyOutcome::failed(key, rev, &e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a document at its current revision, or at `rev` when given.
    ///
    /// The current revision of a deleted document is `NotFound`. A specific
    /// tombstone revision is returned with `deleted = true`. Stubs have no
    /// body and are `NotFound`.
    pub async fn get(&self, key: &str, rev: Option<&Revision>) -> Result<Document> {
        match rev {
            None => {
                let row: Option<(String, i64, Option<Vec<u8>>)> = sqlx::query_as(
                    r#"
                    SELECT d.rev, d.deleted, r.body
                    FROM documents d
                    LEFT JOIN revisions r ON r.key = d.key AND r.rev = d.rev
                    WHERE d.key = ?
                    "#,
                )
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

                let Some((rev, deleted, body)) = row else {
                    return Err(SyncError::not_found(key));
                };
                if deleted != 0 {
                    return Err(SyncError::not_found(key));
                }
                let rev = parse_stored_rev(key, &rev)?;
                let body = body.ok_or_else(|| {
                    SyncError::corruption(key, format!("current revision {} has no body", rev))
                })?;
                Ok(Document {
                    key: key.to_string(),
                    rev,
                    deleted: false,
                    body: codec::decode_body(&body)?,
                })
            }
            Some(rev) => {
                let row: Option<(i64, Option<Vec<u8>>)> = sqlx::query_as(
                    "SELECT deleted, body FROM revisions WHERE key = ? AND rev = ?",
                )
                .bind(key)
                .bind(rev.to_string())
                .fetch_optional(&self.pool)
                .await?;

                match row {
                    Some((deleted, Some(body))) => Ok(Document {
                        key: key.to_string(),
                        rev: rev.clone(),
                        deleted: deleted != 0,
                        body: codec::decode_body(&body)?,
                    }),
                    _ => Err(SyncError::rev_not_found(key, rev)),
                }
            }
        }
    }

    /// A bounded page of change entries after `since`.
    pub async fn changes_page(&self, since: u64, limit: usize) -> Result<ChangesPage> {
        fetch_changes(&self.pool, since, limit).await
    }

    /// Lazy, ascending stream of every change entry after `since`.
    ///
    /// Bounded by the update seq at call time: entries written afterwards are
    /// left for the next call. Restartable from any seq, including 0.
    pub fn changes_since(&self, since: u64) -> BoxStream<'static, Result<ChangeEntry>> {
        let pool = self.pool.clone();
        let until = self.update_seq();
        let state = (pool, since, VecDeque::<ChangeEntry>::new(), since >= until);

        stream::unfold(state, move |(pool, mut cursor, mut buffer, mut exhausted)| async move {
            loop {
                if let Some(entry) = buffer.pop_front() {
                    return Some((Ok(entry), (pool, cursor, buffer, exhausted)));
                }
                if exhausted {
                    return None;
                }
                match fetch_changes(&pool, cursor, STREAM_PAGE_SIZE).await {
                    Ok(page) => {
                        exhausted = page.results.len() < STREAM_PAGE_SIZE || page.last_seq >= until;
                        cursor = page.last_seq;
                        buffer.extend(page.results.into_iter().filter(|e| e.seq <= until));
                    }
                    Err(e) => return Some((Err(e), (pool, cursor, buffer, true))),
                }
            }
        })
        .boxed()
    }

    /// Stream of live (non-deleted) documents ordered by key, as of the call.
    ///
    /// The first page is read inside a read transaction before this returns;
    /// later pages reuse that transaction, so the listing is one WAL snapshot
    /// and writes made after the call never show up. The transaction ends
    /// when the stream is exhausted or dropped.
    pub async fn all_documents(
        &self,
        include_bodies: bool,
        descending: bool,
    ) -> Result<BoxStream<'static, Result<DocumentRow>>> {
        let mut tx = self.pool.begin().await?;
        let first = fetch_documents(&mut tx, None, include_bodies, descending).await?;
        let exhausted = first.len() < STREAM_PAGE_SIZE;
        let after = first.last().map(|r| r.key.clone());
        let reader = if exhausted { None } else { Some(tx) };
        let state = (reader, after, VecDeque::from(first));

        let rows = stream::unfold(state, move |(mut reader, mut after, mut buffer)| async move {
            loop {
                if let Some(row) = buffer.pop_front() {
                    return Some((Ok(row), (reader, after, buffer)));
                }
                let mut tx = reader.take()?;
                match fetch_documents(&mut tx, after.as_deref(), include_bodies, descending).await {
                    Ok(rows) => {
                        if rows.len() == STREAM_PAGE_SIZE {
                            reader = Some(tx);
                        }
                        after = rows.last().map(|r| r.key.clone()).or(after);
                        buffer.extend(rows);
                    }
                    Err(e) => return Some((Err(e), (None, after, buffer))),
                }
            }
        });
        Ok(rows.boxed())
    }

    /// Non-winning, non-deleted leaves of `key`, highest first.
    pub async fn list_conflicts(&self, key: &str) -> Result<Vec<Revision>> {
        Ok(self.resolution(key).await?.conflicts)
    }

    /// Current revision, deleted flag, leaves and conflicts of `key`.
    pub async fn revision_info(&self, key: &str) -> Result<RevisionInfo> {
        let tree = self.load_tree(key).await?;
        let resolution = resolver::resolve(&tree).ok_or_else(|| SyncError::not_found(key))?;
        Ok(RevisionInfo {
            key: key.to_string(),
            rev: resolution.winner,
            deleted: resolution.deleted,
            leaves: tree.leaves().into_iter().map(|n| n.rev.clone()).collect(),
            conflicts: resolution.conflicts,
        })
    }

    /// Every leaf of `key` as a revision document (body + lineage).
    pub async fn leaf_revisions(&self, key: &str) -> Result<Vec<RevisionDoc>> {
        let tree = self.load_tree(key).await?;
        if tree.is_empty() {
            return Err(SyncError::not_found(key));
        }

        let mut docs = Vec::new();
        for leaf in tree.leaves() {
            let body = if leaf.deleted {
                None
            } else {
                Some(self.get(key, Some(&leaf.rev)).await?.body)
            };
            docs.push(RevisionDoc {
                key: key.to_string(),
                rev: leaf.rev.clone(),
                deleted: leaf.deleted,
                body,
                revisions: tree.lineage(&leaf.rev),
            });
        }
        Ok(docs)
    }

    /// Report which of the requested revisions this store does not hold.
    /// Keys with nothing missing are left out of the response.
    pub async fn revs_diff(&self, request: RevsDiffRequest) -> Result<RevsDiffResponse> {
        let mut response = RevsDiffResponse::new();
        for (key, revs) in request {
            let known: HashSet<String> =
                sqlx::query_as::<_, (String,)>("SELECT rev FROM revisions WHERE key = ?")
                    .bind(&key)
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(|(rev,)| rev)
                    .collect();

            let mut missing: Vec<Revision> = Vec::new();
            for rev in revs {
                if !known.contains(&rev.to_string()) && !missing.contains(&rev) {
                    missing.push(rev);
                }
            }
            if !missing.is_empty() {
                response.insert(key, RevsDiffEntry { missing });
            }
        }
        Ok(response)
    }

    /// Update seq and live document count.
    pub async fn info(&self) -> Result<StoreInfo> {
        let (doc_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(StoreInfo {
            node_id: self.id.clone(),
            update_seq: self.update_seq(),
            doc_count: doc_count as u64,
        })
    }

    /// Wait until the update seq exceeds `since` or `timeout` elapses.
    pub async fn wait_for_changes(&self, since: u64, timeout: Duration) -> Result<u64> {
        let mut rx = self.seq_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *rx.borrow_and_update();
            if current > since {
                return Ok(current);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SyncError::Shutdown),
                Err(_) => return Ok(current),
            }
        }
    }

    /// Open a change feed on this store for local listeners.
    pub fn subscribe(self: &Arc<Self>, options: FeedOptions) -> ChangeFeed {
        let source: Arc<dyn ReplicaEndpoint> = Arc::clone(self) as Arc<dyn ReplicaEndpoint>;
        ChangeFeed::open(source, options)
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = sqlite::wal_checkpoint(&self.pool).await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(node_id = %self.id, "Record store closed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn resolution(&self, key: &str) -> Result<Resolution> {
        let tree = self.load_tree(key).await?;
        resolver::resolve(&tree).ok_or_else(|| SyncError::not_found(key))
    }

    async fn load_tree(&self, key: &str) -> Result<RevisionTree> {
        let rows: Vec<(String, Option<String>, i64, i64)> = sqlx::query_as(
            "SELECT rev, parent, deleted, body IS NULL FROM revisions WHERE key = ?",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for (rev, parent, deleted, stub) in rows {
            nodes.push(RevNode {
                rev: parse_stored_rev(key, &rev)?,
                parent: parent.map(|p| parse_stored_rev(key, &p)).transpose()?,
                deleted: deleted != 0,
                stub: stub != 0,
            });
        }
        RevisionTree::from_nodes(key, nodes)
    }

    /// Commit under the write gate; returns the allocated seq.
    async fn commit(&self, pending: PendingCommit) -> Result<u64> {
        let _gate = self.write_gate.lock().await;
        let seq = sqlite::execute_with_retry("commit", || self.commit_once(&pending)).await?;
        self.seq_tx.send_replace(seq);
        crate::metrics::record_change_appended(seq);
        Ok(seq)
    }

    async fn commit_once(&self, pending: &PendingCommit) -> std::result::Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) + 1 FROM changes")
            .fetch_one(&mut *tx)
            .await?;

        for (node, body) in &pending.nodes {
            sqlx::query(
                "INSERT INTO revisions (key, rev, parent, deleted, body) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&pending.key)
            .bind(node.rev.to_string())
            .bind(node.parent.as_ref().map(|p| p.to_string()))
            .bind(node.deleted as i64)
            .bind(body.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        let winner = pending.winner.to_string();
        sqlx::query(
            r#"
            INSERT INTO documents (key, rev, deleted, seq, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                rev = excluded.rev,
                deleted = excluded.deleted,
                seq = excluded.seq,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&pending.key)
        .bind(&winner)
        .bind(pending.deleted as i64)
        .bind(seq)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO changes (seq, key, rev, deleted) VALUES (?, ?, ?, ?)")
            .bind(seq)
            .bind(&pending.key)
            .bind(&winner)
            .bind(pending.deleted as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(seq as u64)
    }
}

impl ReplicaEndpoint for RecordStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn current_seq(&self) -> BoxFuture<'_, u64> {
        let seq = self.update_seq();
        Box::pin(async move { Ok(seq) })
    }

    fn changes(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        Box::pin(self.changes_page(since, limit))
    }

    fn wait_for_changes(&self, since: u64, timeout: Duration) -> BoxFuture<'_, u64> {
        Box::pin(RecordStore::wait_for_changes(self, since, timeout))
    }

    fn revs_diff(&self, request: RevsDiffRequest) -> BoxFuture<'_, RevsDiffResponse> {
        Box::pin(RecordStore::revs_diff(self, request))
    }

    fn leaf_revisions(&self, key: &str) -> BoxFuture<'_, Vec<RevisionDoc>> {
        let key = key.to_string();
        Box::pin(async move { RecordStore::leaf_revisions(self, &key).await })
    }

    fn bulk_apply(&self, docs: Vec<RevisionDoc>) -> BoxFuture<'_, Vec<ApplyOutcome>> {
        Box::pin(self.apply_revisions(docs))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('_') {
        return Err(SyncError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn check_expected(key: &str, expected: Option<&Revision>, current: Option<&Resolution>) -> Result<()> {
    match (expected, current) {
        (None, _) => Ok(()),
        (Some(expected), Some(current)) if current.winner == *expected => Ok(()),
        (Some(expected), current) => Err(SyncError::Conflict {
            key: key.to_string(),
            expected: expected.to_string(),
            current: current.map(|c| c.winner.to_string()),
        }),
    }
}

fn resolved(tree: &RevisionTree) -> Result<Resolution> {
    resolver::resolve(tree).ok_or_else(|| SyncError::corruption(tree.key(), "no leaves"))
}

fn parse_stored_rev(key: &str, raw: &str) -> Result<Revision> {
    raw.parse()
        .map_err(|_| SyncError::corruption(key, format!("unparsable stored revision {:?}", raw)))
}

async fn fetch_changes(pool: &SqlitePool, since: u64, limit: usize) -> Result<ChangesPage> {
    let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
        "SELECT seq, key, rev, deleted FROM changes WHERE seq > ? ORDER BY seq ASC LIMIT ?",
    )
    .bind(i64::try_from(since).unwrap_or(i64::MAX))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut results = Vec::with_capacity(rows.len());
    for (seq, key, rev, deleted) in rows {
        let rev = parse_stored_rev(&key, &rev)?;
        results.push(ChangeEntry {
            seq: seq as u64,
            key,
            rev,
            deleted: deleted != 0,
        });
    }
    let last_seq = results.last().map(|e| e.seq).unwrap_or(since);
    Ok(ChangesPage { results, last_seq })
}

async fn fetch_documents(
    conn: &mut SqliteConnection,
    after: Option<&str>,
    include_bodies: bool,
    descending: bool,
) -> Result<Vec<DocumentRow>> {
    let sql = if descending {
        r#"
        SELECT d.key, d.rev, CASE WHEN ? THEN r.body END
        FROM documents d
        LEFT JOIN revisions r ON r.key = d.key AND r.rev = d.rev
        WHERE d.deleted = 0 AND (? IS NULL OR d.key < ?)
        ORDER BY d.key DESC
        LIMIT ?
        "#
    } else {
        r#"
        SELECT d.key, d.rev, CASE WHEN ? THEN r.body END
        FROM documents d
        LEFT JOIN revisions r ON r.key = d.key AND r.rev = d.rev
        WHERE d.deleted = 0 AND (? IS NULL OR d.key > ?)
        ORDER BY d.key ASC
        LIMIT ?
        "#
    };

    let rows: Vec<(String, String, Option<Vec<u8>>)> = sqlx::query_as(sql)
        .bind(include_bodies as i64)
        .bind(after)
        .bind(after)
        .bind(STREAM_PAGE_SIZE as i64)
        .fetch_all(&mut *conn)
        .await?;

    let mut docs = Vec::with_capacity(rows.len());
    for (key, rev, body) in rows {
        let rev = parse_stored_rev(&key, &rev)?;
        let body = match (include_bodies, body) {
            (false, _) => None,
            (true, Some(blob)) => Some(codec::decode_body(&blob)?),
            (true, None) => {
                return Err(SyncError::corruption(
                    &key,
                    format!("current revision {} has no body", rev),
                ))
            }
        };
        docs.push(DocumentRow { key, rev, body });
    }
    Ok(docs)
}
