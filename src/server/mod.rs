// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface.
//!
//! | method | path                          | purpose                                  |
//! |--------|-------------------------------|------------------------------------------|
//! | POST   | `/cache/table`                | bulk reconciliation (409 while running)  |
//! | GET    | `/cache/data`                 | read entries, or list keys               |
//! | DELETE | `/cache`                      | delete keys of a table                   |
//! | POST   | `/cache/update`               | change event (200 applied, 202 queued)   |
//! | GET    | `/cache/health`               | store connectivity (200 / 503)           |
//! | POST   | `/cache/maintenance/renumber` | move timestamp-numbered chunks           |
//! | POST   | `/cache/maintenance/purge`    | purge payload data from a config table   |
//! | GET    | `/metrics`                    | Prometheus scrape                        |

pub mod error;
mod handlers;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::CacheSyncService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheSyncService>,
    /// Set when the process installed the Prometheus recorder.
    pub metrics: Option<PrometheusHandle>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/cache/table", post(handlers::bulk_cache))
        .route("/cache/data", get(handlers::read_data))
        .route("/cache", axum::routing::delete(handlers::delete_data))
        .route("/cache/update", post(handlers::apply_update))
        .route("/cache/health", get(handlers::health))
        .route("/cache/maintenance/renumber", post(handlers::renumber))
        .route("/cache/maintenance/purge", post(handlers::purge))
        .route("/metrics", get(handlers::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
