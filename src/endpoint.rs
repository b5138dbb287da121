// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication seam.
//!
//! The replicator never talks to a store directly; it talks to a
//! [`ReplicaEndpoint`]. [`RecordStore`](crate::store::RecordStore) implements
//! it in-process and [`HttpEndpoint`](crate::remote::HttpEndpoint) implements
//! it over the HTTP API, so the same direction loop drives push and pull.
//!
//! The wire types here are also the JSON bodies of the HTTP API.
//!
//! # Example
//!
//! ```rust,no_run
//! use docsync::endpoint::ReplicaEndpoint;
//! use docsync::store::RecordStore;
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<RecordStore>) -> docsync::Result<()> {
//! let endpoint: Arc<dyn ReplicaEndpoint> = store;
//! let page = endpoint.changes(0, 50).await?;
//! println!("{} changes up to seq {}", page.results.len(), page.last_seq);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::revision::{Body, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One entry of a store's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Store-local sequence number (strictly increasing, gapless).
    pub seq: u64,
    pub key: String,
    /// Winning revision after the mutation.
    pub rev: Revision,
    /// Whether the winning revision is a tombstone.
    #[serde(default)]
    pub deleted: bool,
}

/// A bounded page of change entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesPage {
    pub results: Vec<ChangeEntry>,
    /// Seq of the last entry in `results`, or the requested `since` if empty.
    pub last_seq: u64,
}

/// Wire form of one revision: body plus its lineage back to the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionDoc {
    pub key: String,
    pub rev: Revision,
    #[serde(default)]
    pub deleted: bool,
    /// Absent for tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    /// `revisions[0] == rev`, then each parent down to generation 1.
    pub revisions: Vec<Revision>,
}

/// How a target store classified a replicated revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Key was absent on the target.
    Created,
    /// Target's current revision is an ancestor of the incoming one.
    FastForward,
    /// Histories diverged; the resolver picked a winner.
    Conflict,
    /// Target already had the revision (no-op, no change entry).
    AlreadyPresent,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::FastForward => "fast_forward",
            Self::Conflict => "conflict",
            Self::AlreadyPresent => "already_present",
        }
    }

    /// Whether applying added a revision (and a change entry).
    pub fn adds_revision(&self) -> bool {
        !matches!(self, Self::AlreadyPresent)
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one document of a bulk apply was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyFailure {
    /// `SyncError::kind()` of the failure.
    pub kind: String,
    pub reason: String,
}

/// Per-document result of a bulk apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub key: String,
    pub rev: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApplyFailure>,
}

impl ApplyOutcome {
    pub fn applied(key: String, rev: Revision, status: ApplyStatus) -> Self {
        Self {
            key,
            rev,
            status: Some(status),
            error: None,
        }
    }

    pub fn failed(key: String, rev: Revision, err: &crate::error::SyncError) -> Self {
        Self {
            key,
            rev,
            status: None,
            error: Some(ApplyFailure {
                kind: err.kind().to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

/// `revs_diff` request: revisions the source holds, per key.
pub type RevsDiffRequest = BTreeMap<String, Vec<Revision>>;

/// `revs_diff` response: only keys with at least one missing revision.
pub type RevsDiffResponse = BTreeMap<String, RevsDiffEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<Revision>,
}

/// Anything the replicator can read changes from or write revisions to.
pub trait ReplicaEndpoint: Send + Sync + 'static {
    /// Stable identity, used in checkpoint keys.
    fn id(&self) -> &str;

    /// The newest seq in this endpoint's change log.
    fn current_seq(&self) -> BoxFuture<'_, u64>;

    /// Change entries with `seq > since`, ascending, at most `limit`.
    fn changes(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage>;

    /// Wait until the update seq exceeds `since` or `timeout` elapses.
    /// Returns the update seq observed (may equal `since` on timeout).
    fn wait_for_changes(&self, since: u64, timeout: Duration) -> BoxFuture<'_, u64>;

    /// Which of the given revisions this endpoint lacks.
    fn revs_diff(&self, request: RevsDiffRequest) -> BoxFuture<'_, RevsDiffResponse>;

    /// Every leaf of a document, with body and lineage.
    fn leaf_revisions(&self, key: &str) -> BoxFuture<'_, Vec<RevisionDoc>>;

    /// Apply replicated revisions. Per-document failures are reported in the
    /// outcomes; an `Err` means the whole call failed and may be retried.
    fn bulk_apply(&self, docs: Vec<RevisionDoc>) -> BoxFuture<'_, Vec<ApplyOutcome>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn test_apply_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&ApplyStatus::FastForward).unwrap(),
            "\"fast_forward\""
        );
        let parsed: ApplyStatus = serde_json::from_str("\"already_present\"").unwrap();
        assert_eq!(parsed, ApplyStatus::AlreadyPresent);
        assert!(!parsed.adds_revision());
        assert!(ApplyStatus::Conflict.adds_revision());
    }

    #[test]
    fn test_revision_doc_tombstone_omits_body() {
        let doc = RevisionDoc {
            key: "o1".into(),
            rev: "2-bb".parse().unwrap(),
            deleted: true,
            body: None,
            revisions: vec!["2-bb".parse().unwrap(), "1-aa".parse().unwrap()],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("body").is_none());
        assert_eq!(json["revisions"][1], "1-aa");
    }

    #[test]
    fn test_revision_doc_rejects_bad_rev() {
        let raw = r#"{"key":"o1","rev":"two-bb","revisions":["two-bb"]}"#;
        assert!(serde_json::from_str::<RevisionDoc>(raw).is_err());
    }

    #[test]
    fn test_apply_outcome_failed_carries_kind() {
        let err = SyncError::corruption("o1", "missing parent");
        let outcome = ApplyOutcome::failed("o1".into(), "1-aa".parse().unwrap(), &err);
        assert!(outcome.status.is_none());
        assert_eq!(outcome.error.as_ref().unwrap().kind, "corruption");
    }
}
