// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backends: the mirrored source tables and the sync configuration table.
//!
//! Source tables are key/document tables:
//! ```sql
//! CREATE TABLE products (
//!   id VARCHAR(255) PRIMARY KEY,
//!   payload LONGTEXT NOT NULL      -- record as JSON text
//! )
//! ```
//!
//! Scans use keyset pagination (`WHERE id > ? ORDER BY id LIMIT ?`); the
//! cursor handed back to callers is the last id of the page.
//!
//! The configuration table:
//! ```sql
//! CREATE TABLE cache_sync_configs (
//!   id VARCHAR(255) PRIMARY KEY,
//!   table_name VARCHAR(255) NOT NULL,
//!   project VARCHAR(255) NOT NULL,
//!   items_per_key BIGINT NOT NULL,
//!   time_to_live BIGINT NOT NULL DEFAULT 0,
//!   status VARCHAR(32) NOT NULL
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as bytes through the `Any` driver, so text
//! columns are read as `String` first and `Vec<u8>` second.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::warn;

use super::traits::{ScanPage, SourceStore, StorageError, TargetCatalog};
use crate::record::{find_id, Record};
use crate::resilience::retry::{retry, RetryConfig};
use crate::target::{CacheTarget, TargetStatus};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Open a pool with startup-mode retry.
pub async fn connect_pool(connection_string: &str) -> Result<AnyPool, StorageError> {
    install_drivers();
    retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(connection_string)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    })
    .await
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is accepted.
fn checked_table_name(name: &str) -> Result<&str, StorageError> {
    if !name.is_empty() && name.len() <= 64 && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(name)
    } else {
        Err(StorageError::Backend(format!("Invalid table name '{}'", name)))
    }
}

fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn parse_payload(table: &str, id: &str, payload: Option<String>) -> Result<Record, StorageError> {
    let payload = payload.ok_or_else(|| StorageError::Corrupt {
        key: format!("{}/{}", table, id),
        reason: "missing payload".to_string(),
    })?;
    serde_json::from_str::<Record>(&payload).map_err(|e| StorageError::Corrupt {
        key: format!("{}/{}", table, id),
        reason: e.to_string(),
    })
}

pub struct SqlSourceStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlSourceStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let pool = connect_pool(connection_string).await?;
        Ok(Self::from_pool(pool, connection_string.starts_with("sqlite:")))
    }

    #[must_use]
    pub fn from_pool(pool: AnyPool, is_sqlite: bool) -> Self {
        Self { pool, is_sqlite }
    }

    /// Create a source table if missing.
    pub async fn create_table(&self, table: &str) -> Result<(), StorageError> {
        let table = checked_table_name(table)?;
        let sql = if self.is_sqlite {
            format!("CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, payload TEXT NOT NULL)", table)
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(255) PRIMARY KEY, payload LONGTEXT NOT NULL)",
                table
            )
        };
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to create {}: {}", table, e)))?;
        Ok(())
    }

    /// Insert or replace a record keyed by its identifier.
    pub async fn upsert(&self, table: &str, record: &Record) -> Result<(), StorageError> {
        let table = checked_table_name(table)?;
        let id = find_id(record)
            .ok_or_else(|| StorageError::Backend("record has no identifier".to_string()))?
            .into_string();
        let payload = serde_json::to_string(record).map_err(|e| StorageError::Backend(e.to_string()))?;
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (id, payload) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                table
            )
        } else {
            format!(
                "INSERT INTO {} (id, payload) VALUES (?, ?) ON DUPLICATE KEY UPDATE payload = VALUES(payload)",
                table
            )
        };
        sqlx::query(&sql)
            .bind(&id)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SourceStore for SqlSourceStore {
    async fn scan(&self, table: &str, cursor: Option<&str>, limit: usize) -> Result<ScanPage, StorageError> {
        let table = checked_table_name(table)?;
        let limit = limit.max(1);
        // One extra row tells us whether another page exists.
        let fetch = (limit + 1) as i64;

        let sql = match cursor {
            Some(_) => format!("SELECT id, payload FROM {} WHERE id > ? ORDER BY id LIMIT ?", table),
            None => format!("SELECT id, payload FROM {} ORDER BY id LIMIT ?", table),
        };

        let rows = retry("sql_scan", &RetryConfig::io(), || async {
            let mut query = sqlx::query(&sql);
            if let Some(after) = cursor {
                query = query.bind(after);
            }
            query
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let mut items = Vec::with_capacity(rows.len().min(limit));
        let mut last_id: Option<String> = None;
        for row in rows.iter().take(limit) {
            let id = text_column(row, "id").unwrap_or_default();
            match parse_payload(table, &id, text_column(row, "payload")) {
                Ok(record) => items.push(record),
                Err(e) => warn!(table, id = %id, error = %e, "Skipping unreadable source row"),
            }
            last_id = Some(id);
        }

        let next_cursor = if rows.len() > limit { last_id } else { None };
        Ok(ScanPage { items, next_cursor })
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        let table = checked_table_name(table)?;
        let sql = format!("SELECT id, payload FROM {} WHERE id = ?", table);
        let row = retry("sql_get", &RetryConfig::io(), || async {
            sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.map(|row| parse_payload(table, id, text_column(&row, "payload")))
            .transpose()
    }
}

/// Reads [`CacheTarget`]s from the sync configuration table.
pub struct SqlTargetCatalog {
    pool: AnyPool,
    table: String,
    is_sqlite: bool,
}

impl SqlTargetCatalog {
    pub fn new(pool: AnyPool, table: &str, is_sqlite: bool) -> Result<Self, StorageError> {
        Ok(Self {
            pool,
            table: checked_table_name(table)?.to_string(),
            is_sqlite,
        })
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let text = if self.is_sqlite { "TEXT" } else { "VARCHAR(255)" };
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id {text} PRIMARY KEY,
                table_name {text} NOT NULL,
                project {text} NOT NULL,
                items_per_key BIGINT NOT NULL,
                time_to_live BIGINT NOT NULL DEFAULT 0,
                status {text} NOT NULL
            )",
            self.table,
            text = text
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to create {}: {}", self.table, e)))?;
        Ok(())
    }

    /// Insert or replace a configuration row.
    pub async fn save(&self, target: &CacheTarget) -> Result<(), StorageError> {
        let delete = format!("DELETE FROM {} WHERE id = ?", self.table);
        let insert = format!(
            "INSERT INTO {} (id, table_name, project, items_per_key, time_to_live, status) VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        );
        let status = match target.status {
            TargetStatus::Active => "active",
            TargetStatus::Inactive => "inactive",
        };
        let mut tx = self.pool.begin().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query(&delete)
            .bind(&target.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query(&insert)
            .bind(&target.id)
            .bind(&target.table_name)
            .bind(&target.project)
            .bind(target.items_per_key as i64)
            .bind(target.time_to_live as i64)
            .bind(status)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tx.commit().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TargetCatalog for SqlTargetCatalog {
    async fn list_targets(&self) -> Result<Vec<CacheTarget>, StorageError> {
        let sql = format!(
            "SELECT id, table_name, project, items_per_key, time_to_live, status FROM {} ORDER BY id",
            self.table
        );
        let rows = retry("sql_list_targets", &RetryConfig::io(), || async {
            sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let mut targets = Vec::with_capacity(rows.len());
        for row in &rows {
            let items_per_key: i64 = row.try_get("items_per_key").unwrap_or(0);
            let time_to_live: i64 = row.try_get("time_to_live").unwrap_or(0);
            targets.push(CacheTarget {
                id: text_column(row, "id").unwrap_or_default(),
                project: text_column(row, "project").unwrap_or_default(),
                table_name: text_column(row, "table_name").unwrap_or_default(),
                items_per_key: items_per_key.max(0) as usize,
                time_to_live: time_to_live.max(0) as u64,
                status: TargetStatus::parse(&text_column(row, "status").unwrap_or_default()),
            });
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn sqlite(dir: &TempDir) -> AnyPool {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display());
        connect_pool(&url).await.unwrap()
    }

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_table_name_check() {
        assert!(checked_table_name("products_v2").is_ok());
        assert!(checked_table_name("").is_err());
        assert!(checked_table_name("x; DROP TABLE y").is_err());
        assert!(checked_table_name("a-b").is_err());
    }

    #[tokio::test]
    async fn test_source_scan_keyset_pagination() {
        let dir = TempDir::new().unwrap();
        let store = SqlSourceStore::from_pool(sqlite(&dir).await, true);
        store.create_table("products").await.unwrap();
        for i in 0..5 {
            store
                .upsert("products", &rec(json!({"id": format!("p{}", i), "name": "thing"})))
                .await
                .unwrap();
        }

        let first = store.scan("products", None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("p1"));

        let second = store.scan("products", first.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(second.items[0]["id"], json!("p2"));
        assert_eq!(second.next_cursor.as_deref(), Some("p3"));

        let last = store.scan("products", second.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_source_upsert_and_get() {
        let dir = TempDir::new().unwrap();
        let store = SqlSourceStore::from_pool(sqlite(&dir).await, true);
        store.create_table("products").await.unwrap();

        store.upsert("products", &rec(json!({"id": "a", "v": 1}))).await.unwrap();
        store.upsert("products", &rec(json!({"id": "a", "v": 2}))).await.unwrap();

        let got = store.get("products", "a").await.unwrap().unwrap();
        assert_eq!(got["v"], json!(2));
        assert!(store.get("products", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_round_trip() {
        let dir = TempDir::new().unwrap();
        let catalog = SqlTargetCatalog::new(sqlite(&dir).await, "cache_sync_configs", true).unwrap();
        catalog.init_schema().await.unwrap();

        catalog
            .save(&CacheTarget::new("shop", "products", 20).with_id("cfg-1").with_ttl(300))
            .await
            .unwrap();
        catalog
            .save(&CacheTarget::new("shop", "orders", 1).with_id("cfg-2").with_status(TargetStatus::Inactive))
            .await
            .unwrap();

        let targets = catalog.list_targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "cfg-1");
        assert_eq!(targets[0].items_per_key, 20);
        assert_eq!(targets[0].time_to_live, 300);
        assert!(targets[0].is_active());
        assert!(!targets[1].is_active());
    }
}
