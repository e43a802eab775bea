// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP error shape.
//!
//! Every error body is `{"code": ..., "message": ...}` with a stable `code`.
//! Internal failures are logged server-side; the client gets a generic message.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use super::types::ErrorResponse;
use crate::error::SyncError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn api_validation_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn api_not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn api_conflict(code: &str, message: &str) -> ApiError {
    ApiError::new(StatusCode::CONFLICT, code, message)
}

/// 500 for a store that was unreachable when the operation started.
pub fn api_unavailable(message: &str) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "unavailable", message)
}

pub fn api_internal(message: &str, err: &SyncError) -> ApiError {
    tracing::error!(error = %err, "request failed");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::Validation(message) => api_validation_error(message),
            SyncError::Conflict(key) => api_conflict(
                "bulk_in_progress",
                &format!("a bulk reconciliation is already running for '{}'", key),
            ),
            SyncError::NotFound(message) => api_not_found(message),
            SyncError::Unavailable(message) => {
                tracing::warn!(error = %message, "store unavailable");
                api_unavailable(&format!("store unavailable: {}", message))
            }
            SyncError::Storage(_) => api_internal("cache operation failed", &err),
        }
    }
}
