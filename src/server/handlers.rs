// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Route handlers. Thin: validate, call the service, shape the response.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use super::error::{api_not_found, api_validation_error, ApiError};
use super::types::{
    BulkCacheRequest, BulkCacheResponse, DataQuery, DeleteQuery, DeleteResponse, PurgeRequest,
    RenumberRequest,
};
use super::AppState;
use crate::events::{ChangeEvent, ChangeEventPayload};

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(api_validation_error(&format!("{} is required", name))),
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| api_validation_error(&rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| api_validation_error(&rejection.body_text()))
}

/// `POST /cache/table`
pub(crate) async fn bulk_cache(
    State(state): State<AppState>,
    payload: Result<Json<BulkCacheRequest>, JsonRejection>,
) -> Result<Json<BulkCacheResponse>, ApiError> {
    let request = body(payload)?;
    let project = required(request.project, "project")?;
    let table = required(request.table, "table")?;
    let records_per_key = match request.records_per_key {
        Some(n) if n >= 1 => n as usize,
        Some(_) => return Err(api_validation_error("recordsPerKey must be at least 1")),
        None => return Err(api_validation_error("recordsPerKey is required")),
    };
    let ttl = match request.ttl.unwrap_or(0) {
        t if t >= 0 => t as u64,
        _ => return Err(api_validation_error("ttl must not be negative")),
    };

    let outcome = state
        .service
        .bulk_cache(&project, &table, records_per_key, ttl)
        .await?;
    Ok(Json(BulkCacheResponse { project, table, outcome }))
}

/// `GET /cache/data`
pub(crate) async fn read_data(
    State(state): State<AppState>,
    params: Result<Query<DataQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let params = query(params)?;
    let project = required(params.project, "project")?;
    let table = required(params.table, "table")?;

    let lookup = state
        .service
        .read_entries(&project, &table, params.key.as_deref(), params.pattern.as_deref())
        .await?;
    if lookup.is_empty() {
        return Err(api_not_found("no cache entries matched"));
    }
    Ok(Json(lookup))
}

/// `DELETE /cache`
pub(crate) async fn delete_data(
    State(state): State<AppState>,
    params: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let params = query(params)?;
    let project = required(params.project, "project")?;
    let table = required(params.table, "table")?;

    let deleted = state
        .service
        .delete_entries(&project, &table, params.pattern.as_deref())
        .await?;
    if deleted == 0 {
        return Err(api_not_found("no cache keys matched"));
    }
    Ok(Json(DeleteResponse { deleted }))
}

/// `POST /cache/update`: 200 when applied, 202 when every target deferred it.
pub(crate) async fn apply_update(
    State(state): State<AppState>,
    payload: Result<Json<ChangeEventPayload>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let event = ChangeEvent::try_from(body(payload)?)?;
    let disposition = state.service.handle_event(event).await?;
    let status = if disposition.is_deferred() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(disposition)))
}

/// `GET /cache/health`
pub(crate) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.service.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// `POST /cache/maintenance/renumber`
pub(crate) async fn renumber(
    State(state): State<AppState>,
    payload: Result<Json<RenumberRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let project = required(request.project, "project")?;
    let table = required(request.table, "table")?;
    let report = state.service.renumber_chunks(&project, &table, request.ttl).await?;
    Ok(Json(report))
}

/// `POST /cache/maintenance/purge`
pub(crate) async fn purge(
    State(state): State<AppState>,
    payload: Result<Json<PurgeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let project = required(request.project, "project")?;
    let report = state
        .service
        .purge_payloads(&project, request.table.as_deref())
        .await?;
    Ok(Json(report))
}

/// `GET /metrics`
pub(crate) async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| api_not_found("metrics exporter not installed"))
}
