// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service wiring: one value that owns every component.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunk_cache_sync::{CacheSyncConfig, CacheSyncService, CacheTarget};
//! use chunk_cache_sync::storage::memory::{InMemoryCacheStore, InMemorySourceStore, InMemoryTargetCatalog};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let catalog = InMemoryTargetCatalog::new(vec![CacheTarget::new("shop", "products", 25)]);
//! let service = CacheSyncService::new(
//!     CacheSyncConfig::default(),
//!     Arc::new(InMemoryCacheStore::new()),
//!     Arc::new(InMemorySourceStore::new()),
//!     Arc::new(catalog),
//! );
//! let outcome = service.bulk_cache("shop", "products", 25, 0).await.expect("bulk run");
//! println!("{} keys written", outcome.stats.cache_keys.len());
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::bulk::BulkReconciler;
use crate::config::CacheSyncConfig;
use crate::coordinator::{BulkOutcome, CoordinatorStats, EventDisposition, OperationCoordinator};
use crate::error::SyncError;
use crate::events::ChangeEvent;
use crate::incremental::IncrementalSynchronizer;
use crate::maintenance::{CleanupReport, ContentPolicy, MaintenanceJobs, RenumberReport};
use crate::resolver::ConfigResolver;
use crate::storage::redis::RedisCacheStore;
use crate::storage::sql::{connect_pool, SqlSourceStore, SqlTargetCatalog};
use crate::storage::traits::{CacheStore, SourceStore, TargetCatalog};
use crate::target::CacheTarget;

/// One cached value as returned to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedValue {
    pub key: String,
    /// Parsed JSON, or the raw string if the value isn't JSON
    pub value: Value,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CacheLookup {
    Entries { entries: Vec<CachedValue> },
    Keys { keys: Vec<String> },
}

impl CacheLookup {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Entries { entries } => entries.is_empty(),
            Self::Keys { keys } => keys.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub cache: bool,
    pub catalog: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub coordinator: CoordinatorStats,
}

pub struct CacheSyncService {
    config: CacheSyncConfig,
    cache: Arc<dyn CacheStore>,
    catalog: Arc<dyn TargetCatalog>,
    resolver: ConfigResolver,
    coordinator: OperationCoordinator,
    maintenance: MaintenanceJobs,
}

impl CacheSyncService {
    pub fn new(
        config: CacheSyncConfig,
        cache: Arc<dyn CacheStore>,
        source: Arc<dyn SourceStore>,
        catalog: Arc<dyn TargetCatalog>,
    ) -> Self {
        let resolver = ConfigResolver::new(catalog.clone());
        let sync = Arc::new(IncrementalSynchronizer::new(cache.clone(), resolver.clone()));
        let reconciler = Arc::new(BulkReconciler::new(cache.clone(), source, config.scan_page_size));
        let coordinator = OperationCoordinator::new(cache.clone(), sync, reconciler);
        let maintenance = MaintenanceJobs::new(
            cache.clone(),
            ContentPolicy::new(&config.payload_fingerprint_fields),
            config.renumber_default_ttl_secs,
        );
        Self {
            config,
            cache,
            catalog,
            resolver,
            coordinator,
            maintenance,
        }
    }

    /// Connect Redis and SQL from `config`.
    ///
    /// The configuration table is created if missing.
    pub async fn connect(config: CacheSyncConfig) -> Result<Self, SyncError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| SyncError::validation("CACHE_SYNC_REDIS_URL is not set"))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| SyncError::validation("CACHE_SYNC_SQL_URL is not set"))?;

        let cache = RedisCacheStore::new(&redis_url)
            .await
            .map_err(|e| SyncError::Unavailable(format!("redis: {}", e)))?;
        let pool = connect_pool(&sql_url)
            .await
            .map_err(|e| SyncError::Unavailable(format!("sql: {}", e)))?;
        let is_sqlite = sql_url.starts_with("sqlite:");

        let catalog = SqlTargetCatalog::new(pool.clone(), &config.config_table, is_sqlite)?;
        catalog.init_schema().await?;
        let source = SqlSourceStore::from_pool(pool, is_sqlite);

        info!(config_table = %config.config_table, is_sqlite, "Connected cache and source stores");
        Ok(Self::new(config, Arc::new(cache), Arc::new(source), Arc::new(catalog)))
    }

    pub fn config(&self) -> &CacheSyncConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &OperationCoordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn maintenance(&self) -> &MaintenanceJobs {
        &self.maintenance
    }

    /// Reconcile `project:table` from the source, under the key's lease.
    pub async fn bulk_cache(
        &self,
        project: &str,
        table: &str,
        records_per_key: usize,
        ttl_secs: u64,
    ) -> Result<BulkOutcome, SyncError> {
        let target = CacheTarget::new(project, table, records_per_key).with_ttl(ttl_secs);
        self.coordinator.run_bulk(&target).await
    }

    /// Route a change event; queued per target while a bulk run holds it.
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<EventDisposition, SyncError> {
        self.coordinator.route_event(event).await
    }

    /// Configured target for (project, table); unconfigured tables get the chunked key layout.
    async fn maintenance_target(&self, project: &str, table: &str) -> Result<CacheTarget, SyncError> {
        match self.resolver.target_for(project, table).await? {
            Some(target) => Ok(target),
            None => {
                debug!(project, table, "No configuration for table, using default key layout");
                Ok(CacheTarget::new(project, table, 2))
            }
        }
    }

    pub async fn renumber_chunks(
        &self,
        project: &str,
        table: &str,
        ttl_secs: Option<u64>,
    ) -> Result<RenumberReport, SyncError> {
        require_names(project, table)?;
        let target = self.maintenance_target(project, table).await?;
        let jobs = &self.maintenance;
        let (report, drained) = self
            .coordinator
            .run_exclusive(&target.lock_key(), || jobs.renumber_timestamp_chunks(&target, ttl_secs))
            .await?;
        debug!(replayed = drained.len(), "Renumbering released key");
        Ok(report)
    }

    /// Purge payload-shaped entries; `table` defaults to the configuration-only table.
    pub async fn purge_payloads(&self, project: &str, table: Option<&str>) -> Result<CleanupReport, SyncError> {
        let table = table
            .filter(|t| !t.is_empty())
            .or(self.config.config_only_table.as_deref())
            .ok_or_else(|| SyncError::validation("table is required (no configuration-only table is configured)"))?;
        require_names(project, table)?;
        let target = self.maintenance_target(project, table).await?;
        let jobs = &self.maintenance;
        let (report, drained) = self
            .coordinator
            .run_exclusive(&target.lock_key(), || jobs.purge_payload_chunks(&target))
            .await?;
        debug!(replayed = drained.len(), "Purge released key");
        Ok(report)
    }

    /// Read cached values of `project:table`.
    ///
    /// With `key`, that one entry; with `pattern`, every matching entry;
    /// with neither, only the key names.
    pub async fn read_entries(
        &self,
        project: &str,
        table: &str,
        key: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<CacheLookup, SyncError> {
        require_names(project, table)?;
        let prefix = format!("{}:{}:", project, table);

        if let Some(key) = key {
            let full = format!("{}{}", prefix, key);
            let entries = match self.cache.get(&full).await? {
                Some(raw) => vec![CachedValue { key: full, value: parse_value(raw) }],
                None => Vec::new(),
            };
            return Ok(CacheLookup::Entries { entries });
        }

        match pattern {
            Some(pattern) => {
                let keys = self.cache.scan_keys(&format!("{}{}", prefix, pattern)).await?;
                let mut entries = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(raw) = self.cache.get(&key).await? {
                        entries.push(CachedValue { key, value: parse_value(raw) });
                    }
                }
                Ok(CacheLookup::Entries { entries })
            }
            None => Ok(CacheLookup::Keys {
                keys: self.cache.scan_keys(&format!("{}*", prefix)).await?,
            }),
        }
    }

    /// Delete keys of `project:table` matching `pattern` (all keys by default).
    pub async fn delete_entries(&self, project: &str, table: &str, pattern: Option<&str>) -> Result<u64, SyncError> {
        require_names(project, table)?;
        let pattern = format!("{}:{}:{}", project, table, pattern.unwrap_or("*"));
        let keys = self.cache.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted = self.cache.delete_many(&keys).await?;
        info!(pattern = %pattern, deleted, "Deleted cache keys");
        Ok(deleted)
    }

    pub async fn health(&self) -> HealthReport {
        let mut errors = Vec::new();
        let cache = match self.cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("cache: {}", e));
                false
            }
        };
        let catalog = match self.catalog.list_targets().await {
            Ok(_) => true,
            Err(e) => {
                errors.push(format!("catalog: {}", e));
                false
            }
        };
        HealthReport {
            healthy: cache && catalog,
            cache,
            catalog,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            coordinator: self.coordinator.stats(),
        }
    }
}

fn require_names(project: &str, table: &str) -> Result<(), SyncError> {
    if project.trim().is_empty() || table.trim().is_empty() {
        return Err(SyncError::validation("project and table are required"));
    }
    Ok(())
}

fn parse_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}
