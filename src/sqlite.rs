// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite pool setup and lock-contention retries shared by the record and
//! checkpoint stores.
//!
//! A deferred transaction that upgrades to a writer while another connection
//! holds the write lock fails with SQLITE_BUSY straight away; `busy_timeout`
//! does not cover it. [`execute_with_retry`] re-runs the whole operation on
//! the [`RetryConfig::sqlite_busy`] schedule, so a retried transaction always
//! starts from a clean slate.

use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Open (creating if missing) a WAL-mode pool at `path`.
pub async fn open_pool(path: impl AsRef<Path>, max_connections: u32) -> Result<SqlitePool> {
    let path = path.as_ref();
    info!(path = %path.display(), max_connections, "Opening record database");

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| SyncError::Config(format!("cannot open {}: {}", path.display(), e)))
}

/// Fold the WAL back into the main file. Called on clean close.
pub async fn wal_checkpoint(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("wal_checkpoint", || {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool)
    })
    .await?;
    debug!("WAL folded into main database");
    Ok(())
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), by code or by message.
pub fn is_lock_contention(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    match db.code() {
        Some(code) => matches!(&*code, "5" | "6"),
        None => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run `op`, re-running it while SQLite reports lock contention.
pub async fn execute_with_retry<F, Fut, T>(operation: &str, mut op: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let schedule = RetryConfig::sqlite_busy();
    let mut failures = 0;

    loop {
        let err = match op().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(operation, failures, "write went through after lock contention");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_lock_contention(&err) {
            return Err(err);
        }
        failures += 1;
        if !schedule.should_retry(failures) {
            warn!(operation, failures, "database still locked, giving up");
            return Err(err);
        }

        let delay = schedule.delay_for_attempt(failures);
        warn!(operation, failures, delay_ms = delay.as_millis() as u64, "database locked, retrying");
        crate::metrics::sqlite_retries_total(operation);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opened_pool_is_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let pool = open_pool(&path, 2).await.unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());

        wal_checkpoint(&pool).await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn success_runs_once() {
        let mut calls = 0;
        let value = execute_with_retry("probe", || {
            calls += 1;
            async { Ok::<_, sqlx::Error>(7) }
        })
        .await
        .unwrap();
        assert_eq!((value, calls), (7, 1));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result = execute_with_retry("probe", || {
            calls += 1;
            async { Err::<(), _>(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn non_database_errors_are_not_contention() {
        assert!(!is_lock_contention(&sqlx::Error::RowNotFound));
        assert!(!is_lock_contention(&sqlx::Error::PoolTimedOut));
    }
}
