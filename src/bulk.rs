// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk reconciliation: scan a whole source table into the cache.
//!
//! The scan is buffered and cut into candidate entries of exactly
//! `items_per_key` records (the tail may be shorter). Each candidate is
//! pruned of records already cached, then written under a key numbered by a
//! counter local to the run.
//!
//! ```text
//! source pages ──► buffer ──► candidate [r1..rN] ──► prune dupes ──► SET chunk:<i>
//!                                                     │
//!                                                     └─ all dupes: skip write
//! ```
//!
//! A failed write is counted and the scan continues. The only errors that
//! abort a run are the ones that happen before anything was written: the
//! cache snapshot and the first source page.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::{CacheEntry, Chunks};
use crate::error::SyncError;
use crate::metrics;
use crate::record::{extract_id, find_id, Record};
use crate::storage::traits::{CacheStore, SourceStore, StorageError};
use crate::target::{CacheTarget, EntryShape};

/// Aggregate outcome of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    pub total_scanned: usize,
    pub successful_writes: usize,
    pub failed_writes: usize,
    /// Records dropped because their id was already cached.
    pub skipped_duplicates: usize,
    /// Candidate entries considered, written or not.
    pub attempted_keys: usize,
    /// Keys actually written, in write order.
    pub cache_keys: Vec<String>,
    /// Ids of records in candidates whose write failed.
    pub failed_ids: Vec<String>,
    /// `successful_writes / attempted_keys`, 0 when nothing was attempted.
    pub fill_rate: f64,
    /// False when the source scan broke off before the last page.
    pub scan_complete: bool,
    pub duration_ms: u64,
}

/// What the cache already holds for a chunked target when the run starts.
#[derive(Debug, Default)]
struct ChunkSnapshot {
    occupied: HashSet<u64>,
    known_ids: HashSet<String>,
}

/// Per-run state.
struct Run<'a> {
    target: &'a CacheTarget,
    snapshot: ChunkSnapshot,
    next_index: u64,
    stats: ReconcileStats,
}

impl Run<'_> {
    /// Next free chunk index of this run, stepping over chunks that predate it.
    fn claim_index(&mut self) -> u64 {
        while self.snapshot.occupied.contains(&self.next_index) {
            self.next_index += 1;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.snapshot.occupied.insert(index);
        index
    }
}

pub struct BulkReconciler {
    cache: Arc<dyn CacheStore>,
    source: Arc<dyn SourceStore>,
    page_size: usize,
}

impl BulkReconciler {
    pub fn new(cache: Arc<dyn CacheStore>, source: Arc<dyn SourceStore>, page_size: usize) -> Self {
        Self {
            cache,
            source,
            page_size: page_size.max(1),
        }
    }

    /// Scan `target.table_name` to completion and populate the cache.
    ///
    /// `target` supplies the project, chunk capacity and TTL.
    #[tracing::instrument(skip(self, target), fields(project = %target.project, table = %target.table_name, items_per_key = target.items_per_key))]
    pub async fn reconcile(&self, target: &CacheTarget) -> Result<ReconcileStats, SyncError> {
        if !target.is_valid() {
            return Err(SyncError::validation(format!(
                "invalid target {}: itemsPerKey must be >= 1 and names non-empty",
                target.id
            )));
        }
        let _timer = metrics::LatencyTimer::new("bulk", "reconcile");
        let started = Instant::now();

        let snapshot = match target.shape() {
            EntryShape::Single => ChunkSnapshot::default(),
            EntryShape::Chunk { .. } => self.snapshot_chunks(target).await?,
        };
        let mut run = Run {
            target,
            snapshot,
            next_index: 0,
            stats: ReconcileStats { scan_complete: true, ..Default::default() },
        };

        let capacity = target.items_per_key.max(1);
        let mut buffer: Vec<Record> = Vec::with_capacity(self.page_size.min(capacity));
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self.source.scan(&target.table_name, cursor.as_deref(), self.page_size).await {
                Ok(page) => page,
                Err(e) if pages == 0 => {
                    metrics::record_error("bulk", "scan", "source");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %e, pages, scanned = run.stats.total_scanned, "Source scan interrupted, flushing what was read");
                    metrics::record_error("bulk", "scan", "source");
                    run.stats.scan_complete = false;
                    break;
                }
            };
            pages += 1;
            run.stats.total_scanned += page.items.len();
            buffer.extend(page.items);

            while buffer.len() >= capacity {
                let candidate: Vec<Record> = buffer.drain(..capacity).collect();
                self.write_candidate(&mut run, candidate).await;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if !buffer.is_empty() {
            let tail = std::mem::take(&mut buffer);
            self.write_candidate(&mut run, tail).await;
        }

        let mut stats = run.stats;
        stats.fill_rate = if stats.attempted_keys == 0 {
            0.0
        } else {
            stats.successful_writes as f64 / stats.attempted_keys as f64
        };
        stats.duration_ms = started.elapsed().as_millis() as u64;

        metrics::record_bulk_run(
            stats.total_scanned,
            stats.successful_writes,
            stats.failed_writes,
            stats.skipped_duplicates,
        );
        info!(
            scanned = stats.total_scanned,
            written = stats.successful_writes,
            failed = stats.failed_writes,
            skipped = stats.skipped_duplicates,
            keys = stats.cache_keys.len(),
            complete = stats.scan_complete,
            duration_ms = stats.duration_ms,
            "Bulk reconciliation finished"
        );
        Ok(stats)
    }

    /// Record existing chunk ids and every record id they hold.
    async fn snapshot_chunks(&self, target: &CacheTarget) -> Result<ChunkSnapshot, StorageError> {
        let chunks = Chunks::new(self.cache.as_ref(), target);
        let mut snapshot = ChunkSnapshot::default();

        for (chunk_id, key) in chunks.keys().await? {
            snapshot.occupied.insert(chunk_id);
            match chunks.load(&key).await {
                Ok(Some(items)) => {
                    snapshot
                        .known_ids
                        .extend(items.iter().filter_map(find_id).map(|id| id.into_string()));
                }
                Ok(None) => {}
                Err(StorageError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Unreadable chunk left in place, its records are not deduplicated");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(chunks = snapshot.occupied.len(), ids = snapshot.known_ids.len(), "Snapshot of cached chunks");
        Ok(snapshot)
    }

    async fn write_candidate(&self, run: &mut Run<'_>, candidate: Vec<Record>) {
        run.stats.attempted_keys += 1;
        match run.target.shape() {
            EntryShape::Single => {
                for record in candidate {
                    self.write_single(run, record).await;
                }
            }
            EntryShape::Chunk { .. } => self.write_chunk(run, candidate).await,
        }
    }

    async fn write_single(&self, run: &mut Run<'_>, record: Record) {
        let id = extract_id(&record).into_string();
        let key = run.target.single_key(&id);

        match self.cache.exists(&key).await {
            Ok(true) => {
                debug!(key = %key, "Already cached, skipping");
                run.stats.skipped_duplicates += 1;
                run.stats.successful_writes += 1;
                metrics::record_operation("bulk", "write", "skipped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                self.record_failure(run, &key, vec![id], &e);
                return;
            }
        }

        let result = match CacheEntry::Single(record).encode() {
            Ok(raw) => self.cache.set(&key, &raw, run.target.ttl()).await,
            err => err.map(|_| ()),
        };
        match result {
            Ok(()) => {
                run.stats.successful_writes += 1;
                run.stats.cache_keys.push(key);
                metrics::record_operation("bulk", "write", "success");
            }
            Err(e) => self.record_failure(run, &key, vec![id], &e),
        }
    }

    async fn write_chunk(&self, run: &mut Run<'_>, candidate: Vec<Record>) {
        let before = candidate.len();
        let mut seen = HashSet::new();
        let fresh: Vec<(String, Record)> = candidate
            .into_iter()
            .map(|record| (extract_id(&record).into_string(), record))
            .filter(|(id, _)| !run.snapshot.known_ids.contains(id) && seen.insert(id.clone()))
            .collect();
        run.stats.skipped_duplicates += before - fresh.len();

        if fresh.is_empty() {
            debug!(records = before, "Every record of the candidate is cached already, skipping write");
            run.stats.successful_writes += 1;
            metrics::record_operation("bulk", "write", "skipped");
            return;
        }

        let index = run.claim_index();
        let key = run.target.chunk_key(index);
        let (ids, items): (Vec<String>, Vec<Record>) = fresh.into_iter().unzip();

        let result = match serde_json::to_string(&items) {
            Ok(raw) => self.cache.set(&key, &raw, run.target.ttl()).await,
            Err(e) => Err(StorageError::Backend(e.to_string())),
        };
        match result {
            Ok(()) => {
                debug!(key = %key, len = items.len(), "Wrote chunk");
                run.snapshot.known_ids.extend(ids);
                run.stats.successful_writes += 1;
                run.stats.cache_keys.push(key);
                metrics::record_operation("bulk", "write", "success");
            }
            Err(e) => self.record_failure(run, &key, ids, &e),
        }
    }

    fn record_failure(&self, run: &mut Run<'_>, key: &str, ids: Vec<String>, error: &StorageError) {
        warn!(key = %key, records = ids.len(), error = %error, "Bulk write failed, continuing scan");
        metrics::record_operation("bulk", "write", "error");
        run.stats.failed_writes += 1;
        run.stats.failed_ids.extend(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryCacheStore, InMemorySourceStore};
    use serde_json::json;

    fn rec(id: &str) -> Record {
        json!({"id": id, "name": format!("item {}", id)}).as_object().cloned().unwrap()
    }

    fn seeded_source(table: &str, n: usize) -> Arc<InMemorySourceStore> {
        let source = Arc::new(InMemorySourceStore::new());
        for i in 0..n {
            source.insert(table, rec(&format!("r{:03}", i)));
        }
        source
    }

    async fn chunk_len(store: &InMemoryCacheStore, key: &str) -> usize {
        let raw = store.get(key).await.unwrap().unwrap();
        serde_json::from_str::<Vec<Record>>(&raw).unwrap().len()
    }

    #[tokio::test]
    async fn test_single_mode_writes_one_key_per_record() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 5), 2);
        let target = CacheTarget::new("shop", "items", 1);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(stats.total_scanned, 5);
        assert_eq!(stats.successful_writes, 5);
        assert_eq!(stats.attempted_keys, 5);
        assert_eq!(stats.failed_writes, 0);
        assert!(stats.scan_complete);
        assert_eq!(stats.fill_rate, 1.0);
        assert!(cache.get("shop:items:r000").await.unwrap().is_some());
        assert_eq!(cache.len(), 5);
    }

    #[tokio::test]
    async fn test_second_single_run_skips_everything() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 4), 10);
        let target = CacheTarget::new("shop", "items", 1);

        reconciler.reconcile(&target).await.unwrap();
        let second = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(second.successful_writes, 4);
        assert_eq!(second.skipped_duplicates, 4);
        assert!(second.cache_keys.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_mode_packs_records_and_flushes_tail() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 5), 3);
        let target = CacheTarget::new("shop", "items", 2).with_ttl(300);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(stats.cache_keys, vec!["shop:items:chunk:0", "shop:items:chunk:1", "shop:items:chunk:2"]);
        assert_eq!(chunk_len(&cache, "shop:items:chunk:0").await, 2);
        assert_eq!(chunk_len(&cache, "shop:items:chunk:2").await, 1);
        assert!(cache.ttl_of("shop:items:chunk:1").is_some());
    }

    #[tokio::test]
    async fn test_chunk_mode_prunes_cached_ids_and_skips_existing_indices() {
        let cache = Arc::new(InMemoryCacheStore::new());
        cache
            .set("shop:items:chunk:0", r#"[{"id":"r000"},{"id":"r001"}]"#, None)
            .await
            .unwrap();
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 4), 10);
        let target = CacheTarget::new("shop", "items", 2);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(stats.skipped_duplicates, 2);
        assert_eq!(stats.attempted_keys, 2);
        assert_eq!(stats.successful_writes, 2);
        // chunk:0 predates the run and is left alone.
        assert_eq!(stats.cache_keys, vec!["shop:items:chunk:1"]);
        assert_eq!(chunk_len(&cache, "shop:items:chunk:0").await, 2);
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_not_fatal() {
        let cache = Arc::new(InMemoryCacheStore::new());
        cache.fail_writes_matching("chunk:1");
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 6), 4);
        let target = CacheTarget::new("shop", "items", 2);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(stats.attempted_keys, 3);
        assert_eq!(stats.successful_writes, 2);
        assert_eq!(stats.failed_writes, 1);
        assert_eq!(stats.failed_ids, vec!["r002", "r003"]);
        assert!((stats.fill_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_interrupted_scan_keeps_partial_result() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let source = seeded_source("items", 10);
        source.fail_scans_after(1);
        let reconciler = BulkReconciler::new(cache.clone(), source, 3);
        let target = CacheTarget::new("shop", "items", 2);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert!(!stats.scan_complete);
        assert_eq!(stats.total_scanned, 3);
        assert_eq!(stats.cache_keys.len(), 2);
    }

    #[tokio::test]
    async fn test_first_page_failure_is_an_error() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let source = seeded_source("items", 3);
        source.fail_scans_after(0);
        let reconciler = BulkReconciler::new(cache.clone(), source, 3);

        let result = reconciler.reconcile(&CacheTarget::new("shop", "items", 2)).await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let reconciler = BulkReconciler::new(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemorySourceStore::new()),
            10,
        );
        let result = reconciler.reconcile(&CacheTarget::new("shop", "items", 0)).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_huge_chunk_capacity_holds_whole_table_in_one_chunk() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let reconciler = BulkReconciler::new(cache.clone(), seeded_source("items", 3), 2);
        let target = CacheTarget::new("big", "items", usize::MAX / 4);

        let stats = reconciler.reconcile(&target).await.unwrap();
        assert_eq!(stats.total_scanned, 3);
        assert_eq!(stats.successful_writes, 1);
        assert_eq!(stats.cache_keys, vec!["big:items:chunk:0"]);
        assert_eq!(chunk_len(&cache, "big:items:chunk:0").await, 3);

        let again = reconciler.reconcile(&CacheTarget::new("big", "items", usize::MAX)).await.unwrap();
        assert_eq!(again.skipped_duplicates, 3);
    }

    #[tokio::test]
    async fn test_empty_table() {
        let reconciler = BulkReconciler::new(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemorySourceStore::new()),
            10,
        );
        let stats = reconciler.reconcile(&CacheTarget::new("shop", "items", 3)).await.unwrap();
        assert_eq!(stats.total_scanned, 0);
        assert_eq!(stats.attempted_keys, 0);
        assert_eq!(stats.fill_rate, 0.0);
        assert!(stats.scan_complete);
    }
}
