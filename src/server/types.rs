// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::coordinator::BulkOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// `POST /cache/table`. Fields are optional here so that a missing one
/// is reported as a validation error rather than a body rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCacheRequest {
    pub project: Option<String>,
    pub table: Option<String>,
    pub records_per_key: Option<i64>,
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCacheResponse {
    pub project: String,
    pub table: String,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

/// `GET /cache/data`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataQuery {
    pub project: Option<String>,
    pub table: Option<String>,
    pub key: Option<String>,
    pub pattern: Option<String>,
}

/// `DELETE /cache`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteQuery {
    pub project: Option<String>,
    pub table: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

/// `POST /cache/maintenance/renumber`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenumberRequest {
    pub project: Option<String>,
    pub table: Option<String>,
    pub ttl: Option<u64>,
}

/// `POST /cache/maintenance/purge`; `table` defaults to the configuration-only table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurgeRequest {
    pub project: Option<String>,
    pub table: Option<String>,
}
