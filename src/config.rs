// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the document store, HTTP server and replicator.
//!
//! Configuration can be built programmatically, loaded from a JSON file, or
//! read from environment variables (after `dotenvy` has loaded a `.env`).
//!
//! # Quick Start
//!
//! ```rust
//! use docsync::config::{SyncConfig, RemoteConfig};
//!
//! let config = SyncConfig {
//!     node_id: "tablet-7".into(),
//!     remote: Some(RemoteConfig::for_testing("http://127.0.0.1:3000/db")),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── node_id: String              # This store's identity (checkpoint keys)
//! ├── store: StoreConfig           # SQLite path, compression threshold
//! ├── server: ServerConfig         # Bind address, static dir, mount path
//! ├── remote: Option<RemoteConfig> # Store to replicate with (if any)
//! └── replication: ReplicationSettings
//!     └── retry: RetrySettings     # Backoff on transient failures
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "node_id": "tablet-7",
//!   "store": { "sqlite_path": "/var/lib/docsync/orders.db" },
//!   "server": { "port": 3000, "static_dir": "./public" },
//!   "remote": { "url": "http://hq.example.com:3000/db" },
//!   "replication": { "live": true, "poll_timeout": "25s" }
//! }
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `HOST` | `server.host` |
//! | `PORT` | `server.port` |
//! | `DOCSYNC_NODE_ID` | `node_id` |
//! | `DOCSYNC_DB_PATH` | `store.sqlite_path` |
//! | `DOCSYNC_STATIC_DIR` | `server.static_dir` |
//! | `DOCSYNC_MOUNT_PATH` | `server.mount_path` |
//! | `DOCSYNC_REMOTE_URL` | `remote.url` |
//! | `DOCSYNC_LIVE` | `replication.live` |

use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object read by the `docsync` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identity of the local store. Used in checkpoint keys and `GET /db`.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Remote store to replicate with. No replication when absent.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub replication: ReplicationSettings,
}

fn default_node_id() -> String {
    "docsync.local".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
            remote: None,
            replication: ReplicationSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing, with the database at `sqlite_path`.
    pub fn for_testing(node_id: &str, sqlite_path: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            store: StoreConfig::for_testing(sqlite_path),
            server: ServerConfig {
                port: 0,
                ..Default::default()
            },
            remote: None,
            replication: ReplicationSettings::for_testing(),
        }
    }

    /// Build from defaults overlaid with environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a variable lookup. Split out from `from_env` so
    /// tests don't have to mutate the process environment.
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| SyncError::Config(format!("PORT is not a port number: {}", port)))?;
        }
        if let Some(node_id) = lookup("DOCSYNC_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(path) = lookup("DOCSYNC_DB_PATH") {
            self.store.sqlite_path = path;
        }
        if let Some(dir) = lookup("DOCSYNC_STATIC_DIR") {
            self.server.static_dir = Some(dir);
        }
        if let Some(mount) = lookup("DOCSYNC_MOUNT_PATH") {
            self.server.mount_path = mount;
        }
        if let Some(url) = lookup("DOCSYNC_REMOTE_URL") {
            if !url.trim().is_empty() {
                self.remote = Some(RemoteConfig {
                    url,
                    ..Default::default()
                });
            }
        }
        if let Some(live) = lookup("DOCSYNC_LIVE") {
            self.replication.live = parse_bool(&live).ok_or_else(|| {
                SyncError::Config(format!("DOCSYNC_LIVE is not a boolean: {}", live))
            })?;
        }
        self.validate()
    }

    /// Reject configurations the server or replicator can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(SyncError::Config("node_id must not be empty".into()));
        }
        if !self.server.mount_path.starts_with('/') || self.server.mount_path == "/" {
            return Err(SyncError::Config(format!(
                "mount_path must start with '/' and not be the root: {}",
                self.server.mount_path
            )));
        }
        if self.replication.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if let Some(remote) = &self.remote {
            if !remote.url.starts_with("http://") && !remote.url.starts_with("https://") {
                return Err(SyncError::Config(format!(
                    "remote url must be http(s): {}",
                    remote.url
                )));
            }
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite record store
// ═══════════════════════════════════════════════════════════════════════════════

/// Record store persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Bodies at or above this many bytes are stored zstd-compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Pool size. Readers use these connections concurrently under WAL.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_sqlite_path() -> String {
    "docsync.db".to_string()
}

fn default_compression_threshold() -> usize {
    4096
}

fn default_max_connections() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            compression_threshold: default_compression_threshold(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn for_testing(sqlite_path: &str) -> Self {
        Self {
            sqlite_path: sqlite_path.to_string(),
            compression_threshold: 256,
            max_connections: 4,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig: HTTP API + static files
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory served for every path outside `mount_path`.
    #[serde(default)]
    pub static_dir: Option<String>,

    /// Where the document API is mounted.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_mount_path() -> String {
    "/db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
            mount_path: default_mount_path(),
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig: the store on the other side of the network
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the remote document API, including the mount path.
    /// Example: `"http://hq.example.com:3000/db"`
    pub url: String,

    /// Per-request timeout as a duration string (e.g., "30s"). Long-poll
    /// requests get the poll timeout added on top.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn for_testing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            request_timeout: "2s".to_string(),
        }
    }

    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Keep replicating until shutdown. When false, each run drains both
    /// feeds once and returns.
    #[serde(default = "default_true")]
    pub live: bool,

    /// Maximum change entries per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a continuous feed waits for new changes before re-polling.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,

    /// Concurrent leaf fetches from the source per batch.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// How long `shutdown()` waits for in-flight batches.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_timeout() -> String {
    "25s".to_string()
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            live: true,
            batch_size: default_batch_size(),
            poll_timeout: default_poll_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            shutdown_timeout: default_shutdown_timeout(),
            retry: RetrySettings::default(),
        }
    }
}

impl ReplicationSettings {
    /// Small batches and short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            live: false,
            batch_size: 10,
            poll_timeout: "200ms".to_string(),
            max_concurrent_fetches: 4,
            shutdown_timeout: "2s".to_string(),
            retry: RetrySettings::for_testing(),
        }
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.poll_timeout, Duration::from_secs(25))
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_timeout, Duration::from_secs(10))
    }

    /// Retry policy for this mode. Live replication never gives up.
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config(self.live)
    }
}

/// Backoff settings as they appear in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Attempts before one-shot replication gives up. Ignored in live mode.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "60s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_attempts() -> usize {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        }
    }

    pub fn to_retry_config(&self, live: bool) -> RetryConfig {
        RetryConfig {
            max_attempts: if live { usize::MAX } else { self.max_attempts.max(1) },
            initial_delay: parse_duration_or(&self.initial_delay, Duration::from_secs(1)),
            max_delay: parse_duration_or(&self.max_delay, Duration::from_secs(60)),
            backoff_factor: self.backoff_factor.max(1.0),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
