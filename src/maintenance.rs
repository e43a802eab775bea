// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-demand repair jobs for a target's cache entries.
//!
//! - [`MaintenanceJobs::renumber_timestamp_chunks`] moves chunks numbered by
//!   the retired timestamp scheme (`chunk:1735776000123`) onto the sequential
//!   range after the highest sequential id.
//! - [`MaintenanceJobs::purge_payload_chunks`] deletes entries whose first
//!   record looks like transactional payload data rather than configuration.
//!
//! Both jobs keep going past per-key failures and report them.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::metrics;
use crate::record::Record;
use crate::storage::traits::{CacheStore, StorageError};
use crate::target::{is_timestamp_suffix, CacheTarget};

/// Field names that mark a record as payload data. Matching ignores case.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    fingerprint_fields: Vec<String>,
}

impl ContentPolicy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fingerprint_fields: fields.into_iter().map(|f| f.as_ref().to_ascii_lowercase()).collect(),
        }
    }

    /// First field of `record` that matches a fingerprint.
    #[must_use]
    pub fn violation<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record
            .keys()
            .find(|field| {
                let lower = field.to_ascii_lowercase();
                self.fingerprint_fields.iter().any(|f| *f == lower)
            })
            .map(String::as_str)
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::new(crate::config::CacheSyncConfig::default().payload_fingerprint_fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenumberedChunk {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenumberReport {
    /// Chunk keys looked at
    pub inspected: usize,
    pub renumbered: Vec<RenumberedChunk>,
    pub failures: Vec<KeyFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub inspected: usize,
    pub deleted: Vec<String>,
    /// Values that weren't JSON; left alone
    pub unreadable: Vec<String>,
    pub failures: Vec<KeyFailure>,
}

pub struct MaintenanceJobs {
    cache: Arc<dyn CacheStore>,
    policy: ContentPolicy,
    default_ttl_secs: u64,
}

impl MaintenanceJobs {
    pub fn new(cache: Arc<dyn CacheStore>, policy: ContentPolicy, default_ttl_secs: u64) -> Self {
        Self {
            cache,
            policy,
            default_ttl_secs,
        }
    }

    /// Move timestamp-numbered chunks to `max(sequential id) + 1` onwards, oldest first.
    ///
    /// Copies carry `ttl_secs` (the job default when `None`, no expiry when 0).
    /// Running again once no timestamp chunks remain changes nothing.
    #[tracing::instrument(skip(self, target), fields(project = %target.project, table = %target.table_name))]
    pub async fn renumber_timestamp_chunks(
        &self,
        target: &CacheTarget,
        ttl_secs: Option<u64>,
    ) -> Result<RenumberReport, SyncError> {
        let keys = self.cache.scan_keys(&target.chunk_pattern()).await?;
        let mut report = RenumberReport { inspected: keys.len(), ..Default::default() };

        let mut next_id: u64 = 0;
        let mut legacy: Vec<(String, String)> = Vec::new();
        for key in keys {
            let Some(suffix) = target.chunk_suffix_of(&key) else { continue };
            if is_timestamp_suffix(suffix) {
                let suffix = suffix.to_string();
                legacy.push((suffix, key));
            } else if let Ok(id) = suffix.parse::<u64>() {
                next_id = next_id.max(id.saturating_add(1));
            }
        }
        if legacy.is_empty() {
            debug!("No timestamp-numbered chunks");
            return Ok(report);
        }
        // Numeric order without parsing: longer digit strings are larger.
        legacy.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        let ttl = match ttl_secs.unwrap_or(self.default_ttl_secs) {
            0 => None,
            secs => Some(secs),
        };

        for (_, from) in legacy {
            let to = target.chunk_key(next_id);
            match self.move_chunk(&from, &to, ttl).await {
                Ok(true) => {
                    debug!(from = %from, to = %to, "Renumbered chunk");
                    report.renumbered.push(RenumberedChunk { from, to });
                    next_id += 1;
                }
                Ok(false) => debug!(key = %from, "Chunk vanished before it could be moved"),
                Err(e) => {
                    warn!(key = %from, error = %e, "Failed to renumber chunk");
                    metrics::record_error("maintenance", "renumber", "storage");
                    report.failures.push(KeyFailure { key: from, error: e.to_string() });
                }
            }
        }

        metrics::record_maintenance("renumber", report.renumbered.len());
        info!(
            renumbered = report.renumbered.len(),
            failed = report.failures.len(),
            "Chunk renumbering finished"
        );
        Ok(report)
    }

    /// Copy `from` to `to`, then delete `from`. `Ok(false)` if `from` is gone.
    async fn move_chunk(&self, from: &str, to: &str, ttl: Option<u64>) -> Result<bool, StorageError> {
        let Some(raw) = self.cache.get(from).await? else {
            return Ok(false);
        };
        self.cache.set(to, &raw, ttl).await?;
        self.cache.delete(from).await?;
        Ok(true)
    }

    /// Delete every entry of `target` whose first record carries a payload fingerprint.
    #[tracing::instrument(skip(self, target), fields(project = %target.project, table = %target.table_name))]
    pub async fn purge_payload_chunks(&self, target: &CacheTarget) -> Result<CleanupReport, SyncError> {
        let keys = self.cache.scan_keys(&target.all_keys_pattern()).await?;
        let mut report = CleanupReport::default();

        for key in keys {
            let raw = match self.cache.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    report.failures.push(KeyFailure { key, error: e.to_string() });
                    continue;
                }
            };
            report.inspected += 1;

            let first = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(items)) => items.into_iter().next(),
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(key = %key, error = %e, "Unreadable entry left in place");
                    report.unreadable.push(key);
                    continue;
                }
            };
            let Some(Value::Object(record)) = first else { continue };
            let Some(field) = self.policy.violation(&record) else { continue };

            match self.cache.delete(&key).await {
                Ok(_) => {
                    info!(key = %key, field = %field, "Purged payload entry from configuration cache");
                    report.deleted.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to purge entry");
                    metrics::record_error("maintenance", "purge", "storage");
                    report.failures.push(KeyFailure { key, error: e.to_string() });
                }
            }
        }

        metrics::record_maintenance("purge", report.deleted.len());
        info!(
            inspected = report.inspected,
            deleted = report.deleted.len(),
            "Payload purge finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryCacheStore;
    use serde_json::json;

    fn jobs(cache: Arc<InMemoryCacheStore>) -> MaintenanceJobs {
        MaintenanceJobs::new(cache, ContentPolicy::default(), 3600)
    }

    #[test]
    fn test_policy_matching_ignores_case() {
        let policy = ContentPolicy::new(["orderId", "shippingAddress"]);
        let order = json!({"id": "1", "ORDERID": "o-1"}).as_object().cloned().unwrap();
        let config = json!({"id": "1", "theme": "dark"}).as_object().cloned().unwrap();
        assert_eq!(policy.violation(&order), Some("ORDERID"));
        assert_eq!(policy.violation(&config), None);
    }

    #[tokio::test]
    async fn test_renumber_moves_timestamp_chunks_after_sequential() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let target = CacheTarget::new("p", "t", 2);
        cache.set("p:t:chunk:0", r#"[{"id":"a"}]"#, None).await.unwrap();
        cache.set("p:t:chunk:3", r#"[{"id":"b"}]"#, None).await.unwrap();
        cache.set("p:t:chunk:1735776000999", r#"[{"id":"late"}]"#, None).await.unwrap();
        cache.set("p:t:chunk:1735776000123", r#"[{"id":"early"}]"#, None).await.unwrap();

        let report = jobs(cache.clone()).renumber_timestamp_chunks(&target, None).await.unwrap();
        assert_eq!(report.inspected, 4);
        assert_eq!(
            report.renumbered,
            vec![
                RenumberedChunk { from: "p:t:chunk:1735776000123".into(), to: "p:t:chunk:4".into() },
                RenumberedChunk { from: "p:t:chunk:1735776000999".into(), to: "p:t:chunk:5".into() },
            ]
        );
        assert_eq!(cache.get("p:t:chunk:4").await.unwrap().unwrap(), r#"[{"id":"early"}]"#);
        assert!(cache.ttl_of("p:t:chunk:5").is_some());
        assert!(cache.ttl_of("p:t:chunk:0").is_none());
        assert_eq!(
            cache.scan_keys("p:t:chunk:*").await.unwrap(),
            vec!["p:t:chunk:0", "p:t:chunk:3", "p:t:chunk:4", "p:t:chunk:5"]
        );
    }

    #[tokio::test]
    async fn test_renumber_is_idempotent() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let target = CacheTarget::new("p", "t", 2);
        cache.set("p:t:chunk:1735776000123", r#"[{"id":"x"}]"#, None).await.unwrap();

        let jobs = jobs(cache.clone());
        let first = jobs.renumber_timestamp_chunks(&target, Some(0)).await.unwrap();
        assert_eq!(first.renumbered[0].to, "p:t:chunk:0");
        assert!(cache.ttl_of("p:t:chunk:0").is_none());

        let second = jobs.renumber_timestamp_chunks(&target, None).await.unwrap();
        assert!(second.renumbered.is_empty());
        assert_eq!(cache.scan_keys("p:t:chunk:*").await.unwrap(), vec!["p:t:chunk:0"]);
    }

    #[tokio::test]
    async fn test_renumber_failure_keeps_original() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let target = CacheTarget::new("p", "t", 2);
        cache.set("p:t:chunk:1735776000123", r#"[{"id":"x"}]"#, None).await.unwrap();
        cache.fail_writes_matching("p:t:chunk:0");

        let report = jobs(cache.clone()).renumber_timestamp_chunks(&target, None).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(cache.get("p:t:chunk:1735776000123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_deletes_payload_shaped_entries_only() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let target = CacheTarget::new("p", "settings", 5);
        cache.set("p:settings:chunk:0", r#"[{"id":"theme","value":"dark"}]"#, None).await.unwrap();
        cache
            .set("p:settings:chunk:1", r#"[{"id":"o1","orderId":"o1","customer":"c"},{"id":"cfg"}]"#, None)
            .await
            .unwrap();
        cache.set("p:settings:o9", r#"{"id":"o9","shippingAddress":"x"}"#, None).await.unwrap();
        cache.set("p:settings:broken", "not json", None).await.unwrap();
        cache.set("p:other:chunk:0", r#"[{"orderId":"o2"}]"#, None).await.unwrap();

        let report = jobs(cache.clone()).purge_payload_chunks(&target).await.unwrap();
        assert_eq!(report.inspected, 4);
        assert_eq!(report.deleted, vec!["p:settings:chunk:1", "p:settings:o9"]);
        assert_eq!(report.unreadable, vec!["p:settings:broken"]);
        assert!(cache.get("p:settings:chunk:0").await.unwrap().is_some());
        assert!(cache.get("p:other:chunk:0").await.unwrap().is_some());
    }
}
