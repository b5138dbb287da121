// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store routes, mounted under `server.mount_path`.
//!
//! Endpoints:
//! - GET / - store info
//! - GET /_changes - page of change entries (optionally long-polled)
//! - POST /_revs_diff - which revisions are missing here
//! - POST /_bulk_docs - apply replicated revisions
//! - GET /_all_docs - live documents by key
//! - GET|PUT|DELETE /:key - document at current or given revision
//! - GET /:key/_rev - revision metadata
//! - GET /:key/_leaves - every leaf with body and lineage
//! - GET /:key/_conflicts - conflicting revisions

use super::error::{ApiError, ApiResult};
use crate::endpoint::{ApplyOutcome, ChangesPage, RevisionDoc, RevsDiffRequest, RevsDiffResponse};
use crate::remote::BulkDocsRequest;
use crate::revision::{Body, Revision};
use crate::store::{DocumentRow, RecordStore, RevisionInfo, StoreInfo};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CHANGES_LIMIT: usize = 100;
const MAX_CHANGES_LIMIT: usize = 10_000;
const DEFAULT_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(25);
const MAX_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct StoreState {
    pub store: Arc<RecordStore>,
}

/// Create the store router
pub fn router(store: Arc<RecordStore>) -> Router {
    Router::new()
        .route("/", get(store_info))
        .route("/_changes", get(changes))
        .route("/_revs_diff", post(revs_diff))
        .route("/_bulk_docs", post(bulk_docs))
        .route("/_all_docs", get(all_docs))
        .route(
            "/:key",
            get(get_document).put(put_document).delete(delete_document),
        )
        .route("/:key/_rev", get(revision_info))
        .route("/:key/_leaves", get(leaf_revisions))
        .route("/:key/_conflicts", get(conflicts))
        .with_state(StoreState { store })
}

// ============================================================================
// Request / response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: u64,
    pub limit: Option<usize>,
    /// `longpoll` waits for a change when the page would be empty.
    pub feed: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RevQuery {
    pub rev: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsQuery {
    #[serde(default)]
    pub include_docs: bool,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub id: String,
    pub rev: Revision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllDocsResponse {
    pub total_rows: usize,
    pub rows: Vec<DocumentRow>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictsResponse {
    pub id: String,
    pub conflicts: Vec<Revision>,
}

fn parse_rev(raw: Option<&str>) -> ApiResult<Option<Revision>> {
    raw.map(|r| r.parse::<Revision>()).transpose().map_err(ApiError::from)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /
async fn store_info(State(state): State<StoreState>) -> ApiResult<Json<StoreInfo>> {
    Ok(Json(state.store.info().await?))
}

/// GET /_changes?since&limit&feed=longpoll&timeout_ms
async fn changes(
    State(state): State<StoreState>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Json<ChangesPage>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHANGES_LIMIT)
        .clamp(1, MAX_CHANGES_LIMIT);

    let page = state.store.changes_page(query.since, limit).await?;
    if !page.results.is_empty() || query.feed.as_deref() != Some("longpoll") {
        return Ok(Json(page));
    }

    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_LONGPOLL_TIMEOUT)
        .min(MAX_LONGPOLL_TIMEOUT);
    state.store.wait_for_changes(query.since, timeout).await?;
    Ok(Json(state.store.changes_page(query.since, limit).await?))
}

/// POST /_revs_diff
async fn revs_diff(
    State(state): State<StoreState>,
    Json(request): Json<RevsDiffRequest>,
) -> ApiResult<Json<RevsDiffResponse>> {
    Ok(Json(state.store.revs_diff(request).await?))
}

/// POST /_bulk_docs
async fn bulk_docs(
    State(state): State<StoreState>,
    Json(request): Json<BulkDocsRequest>,
) -> ApiResult<Json<Vec<ApplyOutcome>>> {
    Ok(Json(state.store.apply_revisions(request.docs).await?))
}

/// GET /_all_docs?include_docs&descending
async fn all_docs(
    State(state): State<StoreState>,
    Query(query): Query<AllDocsQuery>,
) -> ApiResult<Json<AllDocsResponse>> {
    let rows: Vec<DocumentRow> = state
        .store
        .all_documents(query.include_docs, query.descending)
        .await?
        .try_collect()
        .await?;
    Ok(Json(AllDocsResponse {
        total_rows: rows.len(),
        rows,
    }))
}

/// GET /:key?rev
async fn get_document(
    State(state): State<StoreState>,
    Path(key): Path<String>,
    Query(query): Query<RevQuery>,
) -> ApiResult<Json<Value>> {
    let rev = parse_rev(query.rev.as_deref())?;
    let doc = state.store.get(&key, rev.as_ref()).await?;
    Ok(Json(doc.to_json()))
}

/// PUT /:key?rev
///
/// The expected revision comes from `?rev=` or the body's `_rev`. A body with
/// `"_deleted": true` deletes instead.
async fn put_document(
    State(state): State<StoreState>,
    Path(key): Path<String>,
    Query(query): Query<RevQuery>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<WriteResponse>)> {
    let Value::Object(mut body) = body else {
        return Err(ApiError::bad_request("document body must be a JSON object"));
    };

    let body_rev = match body.remove("_rev") {
        Some(Value::String(rev)) => Some(rev),
        Some(Value::Null) | None => None,
        Some(_) => return Err(ApiError::bad_request("_rev must be a string")),
    };
    let deleted = matches!(body.remove("_deleted"), Some(Value::Bool(true)));
    body.remove("_id");

    let expected = parse_rev(query.rev.as_deref().or(body_rev.as_deref()))?;

    let rev = if deleted {
        let expected = expected.ok_or_else(|| ApiError::bad_request("delete requires a revision"))?;
        state.store.delete(&key, &expected).await?
    } else {
        state.store.put(&key, strip_reserved(body), expected.as_ref()).await?
    };

    Ok((StatusCode::CREATED, Json(WriteResponse { ok: true, id: key, rev })))
}

/// DELETE /:key?rev
async fn delete_document(
    State(state): State<StoreState>,
    Path(key): Path<String>,
    Query(query): Query<RevQuery>,
) -> ApiResult<Json<WriteResponse>> {
    let expected = parse_rev(query.rev.as_deref())?
        .ok_or_else(|| ApiError::bad_request("delete requires ?rev="))?;
    let rev = state.store.delete(&key, &expected).await?;
    Ok(Json(WriteResponse { ok: true, id: key, rev }))
}

/// GET /:key/_rev
async fn revision_info(
    State(state): State<StoreState>,
    Path(key): Path<String>,
) -> ApiResult<Json<RevisionInfo>> {
    Ok(Json(state.store.revision_info(&key).await?))
}

/// GET /:key/_leaves
async fn leaf_revisions(
    State(state): State<StoreState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<RevisionDoc>>> {
    Ok(Json(state.store.leaf_revisions(&key).await?))
}

/// GET /:key/_conflicts
async fn conflicts(
    State(state): State<StoreState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ConflictsResponse>> {
    let conflicts = state.store.list_conflicts(&key).await?;
    Ok(Json(ConflictsResponse { id: key, conflicts }))
}

/// Drop any remaining `_`-prefixed metadata fields from a client body.
fn strip_reserved(mut body: Body) -> Body {
    body.retain(|field, _| !field.starts_with('_'));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_reserved() {
        let body = json!({"_attachments": {}, "_conflicts": [], "quantity": 5})
            .as_object()
            .cloned()
            .unwrap();
        let stripped = strip_reserved(body);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped["quantity"], 5);
    }

    #[test]
    fn test_parse_rev() {
        assert!(parse_rev(None).unwrap().is_none());
        assert_eq!(parse_rev(Some("2-ab")).unwrap().unwrap().generation(), 2);
        assert!(parse_rev(Some("nope")).is_err());
    }
}
