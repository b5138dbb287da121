// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Records through the `metrics` facade; installing an exporter is up to the
//! embedding application. Covers:
//! - Local writes and change-log growth
//! - Replicated revision application (by classification)
//! - Batch, checkpoint and error stats per replication direction
//! - Replicator lifecycle and remote connectivity
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `docsync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use docsync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_write("put", Duration::from_millis(3));
//! metrics::record_checkpoint_persist("push", true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Record Store
// =============================================================================

/// Record a local write (put, create, delete) and its latency.
pub fn record_write(operation: &str, duration: Duration) {
    counter!("docsync_writes_total", "operation" => operation.to_string()).increment(1);
    histogram!("docsync_write_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a change entry appended to the change log.
pub fn record_change_appended(seq: u64) {
    counter!("docsync_changes_appended_total").increment(1);
    gauge!("docsync_update_seq").set(seq as f64);
}

/// Record a compressed body (size before and after).
pub fn record_body_compressed(raw_bytes: usize, compressed_bytes: usize) {
    counter!("docsync_bodies_compressed_total").increment(1);
    histogram!("docsync_body_compression_ratio")
        .record(compressed_bytes as f64 / raw_bytes.max(1) as f64);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("docsync_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a replicated revision applied to this store.
///
/// `status` is the classification: created, fast_forward, conflict, already_present.
pub fn record_revision_applied(status: &str) {
    counter!("docsync_revisions_applied_total", "status" => status.to_string()).increment(1);
    if status == "conflict" {
        counter!("docsync_conflicts_total").increment(1);
    }
}

/// Record a document skipped because its revision history is corrupt.
pub fn record_corrupt_document(direction: &str) {
    counter!("docsync_corrupt_documents_total", "direction" => direction.to_string()).increment(1);
}

// =============================================================================
// Change Feed
// =============================================================================

/// Record change entries delivered by a feed.
pub fn record_feed_delivered(source: &str, count: usize) {
    counter!("docsync_feed_entries_total", "source" => source.to_string()).increment(count as u64);
}

// =============================================================================
// Replication
// =============================================================================

/// Record batch flush with detailed stats.
#[allow(clippy::too_many_arguments)]
pub fn record_batch_flush(
    direction: &str,
    total: usize,
    applied: usize,
    skipped: usize,
    conflicts: usize,
    corrupt: usize,
    duration: Duration,
) {
    let dir = direction.to_string();

    counter!("docsync_batches_total", "direction" => dir.clone()).increment(1);
    counter!("docsync_batch_keys_total", "direction" => dir.clone()).increment(total as u64);
    counter!("docsync_batch_applied_total", "direction" => dir.clone()).increment(applied as u64);
    counter!("docsync_batch_skipped_total", "direction" => dir.clone()).increment(skipped as u64);
    if conflicts > 0 {
        counter!("docsync_batch_conflicts_total", "direction" => dir.clone())
            .increment(conflicts as u64);
    }
    if corrupt > 0 {
        counter!("docsync_batch_corrupt_total", "direction" => dir.clone())
            .increment(corrupt as u64);
    }

    histogram!("docsync_batch_flush_duration_seconds", "direction" => dir.clone())
        .record(duration.as_secs_f64());
    histogram!("docsync_batch_size", "direction" => dir).record(total as f64);
}

/// Record batch dedup stats (entries collapsed onto the same key).
pub fn record_batch_dedup(direction: &str, before_dedup: usize, after_dedup: usize) {
    let deduped = before_dedup.saturating_sub(after_dedup);
    if deduped > 0 {
        counter!("docsync_batch_deduped_total", "direction" => direction.to_string())
            .increment(deduped as u64);
    }
}

/// Record checkpoint persistence.
pub fn record_checkpoint_persist(direction: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("docsync_checkpoint_persists_total", "direction" => direction.to_string(), "status" => status).increment(1);
}

/// Current checkpoint of a direction (source seq fully transferred).
pub fn set_checkpoint_seq(direction: &str, seq: u64) {
    gauge!("docsync_checkpoint_seq", "direction" => direction.to_string()).set(seq as f64);
}

/// Record a replication error by kind.
pub fn record_replication_error(direction: &str, kind: &str) {
    counter!("docsync_replication_errors_total", "direction" => direction.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Gauge for replicator state.
pub fn set_replicator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("docsync_replicator_state").set(value);
}

// =============================================================================
// Remote endpoint
// =============================================================================

/// Record a request to a remote store.
pub fn record_remote_request(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("docsync_remote_requests_total", "operation" => operation.to_string(), "status" => status).increment(1);
    histogram!("docsync_remote_request_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Remote connectivity (0=unknown, 1=online, 2=offline).
pub fn set_remote_state(endpoint: &str, state: &str) {
    let value = match state {
        "unknown" => 0.0,
        "online" => 1.0,
        "offline" => 2.0,
        _ => -1.0,
    };
    gauge!("docsync_remote_state", "endpoint" => endpoint.to_string()).set(value);
}

// =============================================================================
// HTTP server
// =============================================================================

/// Record an API error response.
pub fn record_api_error(kind: &str) {
    counter!("docsync_api_errors_total", "kind" => kind.to_string()).increment(1);
}
