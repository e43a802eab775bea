// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the chunk cache.
//!
//! Values are plain Redis STRINGs holding JSON. Keys are written exactly as
//! the caller builds them (`project:table:...`), so the cache stays readable
//! by other consumers of the same Redis instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client};

use super::traits::{CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

pub struct RedisCacheStore {
    connection: ConnectionManager,
    retry: RetryConfig,
}

impl RedisCacheStore {
    /// Connect with startup-mode retry (fails fast on a bad URL or dead server).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            retry: RetryConfig::io(),
        })
    }

    /// Override the per-call retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        retry("redis_get", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry("redis_set", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            let value = value.to_string();
            async move {
                match ttl_secs {
                    Some(ttl) if ttl > 0 => {
                        let _: () = conn.set_ex(&key, &value, ttl).await?;
                    }
                    _ => {
                        let _: () = conn.set(&key, &value).await?;
                    }
                }
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        retry("redis_del", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let removed: u64 = conn.del(&key).await?;
                Ok(removed)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    /// Pipelined `DEL` for all keys.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        retry("redis_del_many", &self.retry, || {
            let mut conn = conn.clone();
            let keys = keys.to_vec();
            async move {
                let mut pipeline = pipe();
                for key in &keys {
                    pipeline.del(key);
                }
                let counts: Vec<u64> = pipeline.query_async(&mut conn).await?;
                Ok(counts.into_iter().sum())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        retry("redis_exists", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let exists: bool = conn.exists(&key).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    /// `SCAN cursor MATCH pattern COUNT n` until the cursor wraps to 0.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = Vec::new();
        let mut cursor = 0u64;

        loop {
            let conn = self.connection.clone();
            let (next, batch): (u64, Vec<String>) = retry("redis_scan", &self.retry, || {
                let mut conn = conn.clone();
                let pattern = pattern.to_string();
                async move {
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(format!("Failed to scan keys: {}", e)))?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }
}
