// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store access over the HTTP API.
//!
//! [`HttpEndpoint`] implements [`ReplicaEndpoint`] against a `docsync`
//! server's mount path (e.g. `http://hq:3000/db`), so the replicator treats a
//! remote store exactly like a local one.
//!
//! # Connection State
//!
//! ```text
//! Unknown ──(request ok)──▶ Online ◀──┐
//!    │                        │        │ request ok
//!    └──(network failure)──▶ Offline ─┘
//! ```
//!
//! State is derived from request outcomes only (no background pinging) and is
//! meant for an online/offline badge in the application.
//!
//! # Error Mapping
//!
//! | Outcome | Error |
//! |---------|-------|
//! | connect failure, timeout, 5xx | `TransientNetwork` (retried) |
//! | error body kind `corruption` | `Corruption` (document skipped) |
//! | 404 | `NotFound` |
//! | 400 | `InvalidRevision` |
//! | any other non-2xx | `Remote` |

use crate::endpoint::{
    ApplyOutcome, BoxFuture, ChangesPage, ReplicaEndpoint, RevisionDoc, RevsDiffRequest,
    RevsDiffResponse,
};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::StoreInfo;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extra time granted to a long-poll beyond the server-side wait.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Connectivity of a remote store as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No request has completed yet.
    Unknown,
    /// Last request reached the server.
    Online,
    /// Last request failed to reach the server.
    Offline,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Online,
            2 => ConnectionState::Offline,
            _ => ConnectionState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
        }
    }
}

/// Error body returned by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub reason: String,
}

/// `POST /_bulk_docs` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    pub docs: Vec<RevisionDoc>,
}

/// A remote store reached over HTTP.
pub struct HttpEndpoint {
    client: Client,
    /// Mount URL without trailing slash.
    base: String,
    request_timeout: Duration,
    state: AtomicU8,
}

impl HttpEndpoint {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base = config.url.trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "remote url must be http(s): {}",
                config.url
            )));
        }

        let request_timeout = config.request_timeout_duration();
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(url = %base, timeout_ms = request_timeout.as_millis() as u64, "Remote endpoint configured");
        metrics::set_remote_state(&base, ConnectionState::Unknown.as_str());

        Ok(Self {
            client,
            base,
            request_timeout,
            state: AtomicU8::new(0),
        })
    }

    /// Mount URL of the remote store.
    pub fn url(&self) -> &str {
        &self.base
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        let value = match state {
            ConnectionState::Unknown => 0,
            ConnectionState::Online => 1,
            ConnectionState::Offline => 2,
        };
        let previous = self.state.swap(value, Ordering::Relaxed);
        if previous != value {
            match state {
                ConnectionState::Offline => warn!(url = %self.base, "Remote store offline"),
                _ => info!(url = %self.base, state = state.as_str(), "Remote store reachable"),
            }
            metrics::set_remote_state(&self.base, state.as_str());
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn doc_url(&self, key: &str, suffix: &str) -> String {
        format!("{}/{}{}", self.base, urlencoding::encode(key), suffix)
    }

    /// Store info of the remote (also a cheap reachability probe).
    pub async fn info(&self) -> Result<StoreInfo> {
        let request = self.client.get(self.base.as_str());
        self.send("info", "", request, self.request_timeout).await
    }

    /// Send a request and decode a JSON response, mapping failures to
    /// [`SyncError`] and tracking connection state.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<T> {
        let started = Instant::now();
        let outcome = self.send_inner(key, request.timeout(timeout)).await;
        metrics::record_remote_request(operation, outcome.is_ok(), started.elapsed());

        if let Err(e) = &outcome {
            debug!(operation, url = %self.base, error = %e, "Remote request failed");
        }
        outcome
    }

    async fn send_inner<T: DeserializeOwned>(&self, key: &str, request: RequestBuilder) -> Result<T> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.set_state(ConnectionState::Offline);
                return Err(SyncError::transient(&self.base, e.to_string()));
            }
        };
        self.set_state(ConnectionState::Online);

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| SyncError::transient(&self.base, format!("bad response body: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        Err(self.status_error(status, key, &text))
    }

    fn status_error(&self, status: StatusCode, key: &str, body: &str) -> SyncError {
        let parsed: Option<ErrorResponse> = serde_json::from_str(body).ok();
        let reason = parsed
            .as_ref()
            .map(|e| e.reason.clone())
            .unwrap_or_else(|| body.to_string());

        if parsed.as_ref().map(|e| e.error.as_str()) == Some("corruption") {
            return SyncError::corruption(key, reason);
        }
        match status {
            StatusCode::NOT_FOUND => SyncError::not_found(key),
            StatusCode::BAD_REQUEST => SyncError::InvalidRevision(reason),
            s if s.is_server_error() => {
                SyncError::transient(&self.base, format!("{}: {}", s, reason))
            }
            s => SyncError::Remote {
                status: s.as_u16(),
                message: reason,
            },
        }
    }
}

impl ReplicaEndpoint for HttpEndpoint {
    fn id(&self) -> &str {
        &self.base
    }

    fn current_seq(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(self.info().await?.update_seq) })
    }

    fn changes(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url_for("/_changes"))
                .query(&[("since", since.to_string()), ("limit", limit.to_string())]);
            self.send("changes", "", request, self.request_timeout).await
        })
    }

    fn wait_for_changes(&self, since: u64, timeout: Duration) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let request = self.client.get(self.url_for("/_changes")).query(&[
                ("since", since.to_string()),
                ("limit", "1".to_string()),
                ("feed", "longpoll".to_string()),
                ("timeout_ms", timeout.as_millis().to_string()),
            ]);
            let page: ChangesPage = self
                .send("wait_for_changes", "", request, timeout + LONG_POLL_GRACE)
                .await?;
            Ok(page.last_seq)
        })
    }

    fn revs_diff(&self, request: RevsDiffRequest) -> BoxFuture<'_, RevsDiffResponse> {
        Box::pin(async move {
            let http = self.client.post(self.url_for("/_revs_diff")).json(&request);
            self.send("revs_diff", "", http, self.request_timeout).await
        })
    }

    fn leaf_revisions(&self, key: &str) -> BoxFuture<'_, Vec<RevisionDoc>> {
        let key = key.to_string();
        Box::pin(async move {
            let request = self.client.get(self.doc_url(&key, "/_leaves"));
            self.send("leaf_revisions", &key, request, self.request_timeout).await
        })
    }

    fn bulk_apply(&self, docs: Vec<RevisionDoc>) -> BoxFuture<'_, Vec<ApplyOutcome>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.url_for("/_bulk_docs"))
                .json(&BulkDocsRequest { docs });
            self.send("bulk_apply", "", request, self.request_timeout).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> HttpEndpoint {
        HttpEndpoint::new(&RemoteConfig::for_testing("http://127.0.0.1:1/db/")).unwrap()
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = HttpEndpoint::new(&RemoteConfig::for_testing("ftp://x/db")).err().unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_urls_strip_slash_and_encode_keys() {
        let remote = endpoint();
        assert_eq!(remote.url(), "http://127.0.0.1:1/db");
        assert_eq!(
            remote.doc_url("2024-01-01T00:00:00.000Z", "/_leaves"),
            "http://127.0.0.1:1/db/2024-01-01T00%3A00%3A00.000Z/_leaves"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        let remote = endpoint();
        let corrupt = r#"{"error":"corruption","reason":"missing parent"}"#;
        assert!(matches!(
            remote.status_error(StatusCode::INTERNAL_SERVER_ERROR, "o1", corrupt),
            SyncError::Corruption { .. }
        ));
        assert!(remote
            .status_error(StatusCode::SERVICE_UNAVAILABLE, "", "down")
            .is_retryable());
        assert!(matches!(
            remote.status_error(StatusCode::NOT_FOUND, "o1", ""),
            SyncError::NotFound { .. }
        ));
        assert!(matches!(
            remote.status_error(StatusCode::BAD_REQUEST, "", r#"{"error":"bad_request","reason":"x"}"#),
            SyncError::InvalidRevision(_)
        ));
        assert!(matches!(
            remote.status_error(StatusCode::FORBIDDEN, "", ""),
            SyncError::Remote { status: 403, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_remote_goes_offline() {
        let remote = endpoint();
        assert_eq!(remote.connection_state(), ConnectionState::Unknown);

        let err = remote.changes(0, 10).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.connection_state(), ConnectionState::Offline);
    }
}
