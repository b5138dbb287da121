// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the document store and replicator.
//!
//! Errors are split by who has to deal with them. Local write failures
//! (`NotFound`, `Conflict`) go back to the immediate caller and never reach
//! the replicator's observer channel. Network failures are retried by the
//! replicator with backoff. Corruption is fatal to one document only.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `NotFound` | No | Unknown key or revision |
//! | `Conflict` | No | Expected revision does not match current |
//! | `TransientNetwork` | Yes | Connect failure, timeout, 5xx from a remote store |
//! | `Corruption` | No | Revision history invariant violated for a document |
//! | `InvalidRevision` | No | Unparsable revision marker or broken lineage |
//! | `InvalidKey` | No | Empty or reserved document key |
//! | `Storage` | No | Local SQLite errors (needs operator attention) |
//! | `Encoding` | No | JSON or zstd failure on a document body |
//! | `Remote` | No | Remote store answered with an unexpected status |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Replicator lifecycle violation |
//! | `Shutdown` | No | Replicator is shutting down |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether the replicator should
//! back off and try again.

use thiserror::Error;

/// Result type alias for store and replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while storing or replicating documents.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Unknown key, unknown revision, or a revision whose body is not held.
    #[error("Not found: {key}{}", rev.as_ref().map(|r| format!(" @ {}", r)).unwrap_or_default())]
    NotFound { key: String, rev: Option<String> },

    /// Optimistic concurrency failure on an explicit write.
    ///
    /// The caller should re-read the document and retry with fresh data.
    #[error("Conflict on {key}: expected {expected}, current {}", current.as_deref().unwrap_or("none"))]
    Conflict {
        key: String,
        expected: String,
        current: Option<String>,
    },

    /// Connection failure, timeout or 5xx-equivalent from a remote store.
    ///
    /// Retried by the replicator with exponential backoff.
    #[error("Transient network error ({endpoint}): {message}")]
    TransientNetwork { endpoint: String, message: String },

    /// Revision history invariant violated (e.g. missing parent).
    ///
    /// Fatal to the affected document only; the rest of the store keeps working.
    #[error("Corrupt revision history for {key}: {message}")]
    Corruption { key: String, message: String },

    /// Revision marker could not be parsed, or a lineage is malformed.
    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    /// Empty key, or a key starting with `_` (reserved for API routes).
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// SQLite error in the record or checkpoint store.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Body serialization or (de)compression failure.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Remote store rejected a request in a way that retrying won't fix.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl SyncError {
    /// Unknown key.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound {
            key: key.into(),
            rev: None,
        }
    }

    /// Unknown revision of a key.
    pub fn rev_not_found(key: impl Into<String>, rev: impl ToString) -> Self {
        Self::NotFound {
            key: key.into(),
            rev: Some(rev.to_string()),
        }
    }

    /// Network failure talking to `endpoint`.
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Broken revision history for `key`.
    pub fn corruption(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::NotFound { .. } => false,
            Self::Conflict { .. } => false,
            Self::Corruption { .. } => false,
            Self::InvalidRevision(_) => false,
            Self::InvalidKey(_) => false,
            Self::Storage(_) => false, // Local DB issues need attention
            Self::Encoding(_) => false,
            Self::Remote { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Short machine-readable name, used for metrics labels and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::TransientNetwork { .. } => "transient_network",
            Self::Corruption { .. } => "corruption",
            Self::InvalidRevision(_) => "bad_request",
            Self::InvalidKey(_) => "bad_request",
            Self::Storage(_) => "storage",
            Self::Encoding(_) => "encoding",
            Self::Remote { .. } => "remote",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(format!("json: {}", e))
    }
}
