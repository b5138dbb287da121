// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mapping of [`SyncError`] onto HTTP responses.

use crate::error::SyncError;
use crate::remote::ErrorResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

/// Handler error: a [`SyncError`] rendered as `{error, reason}`.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError(SyncError::InvalidRevision(message.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            SyncError::InvalidRevision(_) | SyncError::InvalidKey(_) | SyncError::Encoding(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::TransientNetwork { .. } | SyncError::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.0.kind();

        if status.is_server_error() {
            error!(kind, error = %self.0, "Request failed");
        } else if status != StatusCode::NOT_FOUND {
            warn!(kind, error = %self.0, "Request rejected");
        }
        crate::metrics::record_api_error(kind);

        let body = Json(ErrorResponse {
            error: kind.to_string(),
            reason: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (SyncError::not_found("o1"), StatusCode::NOT_FOUND),
            (
                SyncError::Conflict {
                    key: "o1".into(),
                    expected: "1-a".into(),
                    current: None,
                },
                StatusCode::CONFLICT,
            ),
            (SyncError::InvalidRevision("x".into()), StatusCode::BAD_REQUEST),
            (SyncError::InvalidKey("_x".into()), StatusCode::BAD_REQUEST),
            (SyncError::transient("r", "down"), StatusCode::SERVICE_UNAVAILABLE),
            (SyncError::corruption("o1", "gap"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status_code(), expected);
        }
    }

    #[test]
    fn test_into_response_status() {
        let response = ApiError::bad_request("missing rev").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
