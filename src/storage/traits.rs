// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::Record;
use crate::target::CacheTarget;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt cache value at '{key}': {reason}")]
    Corrupt {
        key: String,
        reason: String,
    },
}

/// One page of a source-table scan.
///
/// `next_cursor` is `None` once the table has been read to completion.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Record>,
    pub next_cursor: Option<String>,
}

/// String key-value cache holding single entries and chunks.
///
/// Values are opaque JSON strings; chunk semantics live above this layer.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, expiring after `ttl_secs` when given.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError>;

    /// Delete a key, returning how many keys were removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64, StorageError>;

    /// Delete several keys. Default implementation falls back to sequential deletes.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for key in keys {
            removed += self.delete(key).await?;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// All keys matching a glob pattern (`*`, `?`). Cursor pagination is internal.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// The independently-mutated table the cache mirrors.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Read up to `limit` records after `cursor` (start of table when `None`).
    async fn scan(&self, table: &str, cursor: Option<&str>, limit: usize) -> Result<ScanPage, StorageError>;

    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError>;
}

/// Read-only view of the sync configuration table.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<CacheTarget>, StorageError>;
}
