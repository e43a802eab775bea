// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache sync service.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The binary installs a Prometheus recorder; embedders may choose another.
//!
//! # Metric Naming Convention
//! - `cache_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `path`: bulk, incremental, maintenance
//! - `operation`: insert, modify, remove, write, renumber, purge
//! - `status`: success, error, skipped, queued, not_found

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of one cache mutation.
pub fn record_operation(path: &str, operation: &str, status: &str) {
    counter!(
        "cache_sync_operations_total",
        "path" => path.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(path: &str, operation: &str, duration: Duration) {
    histogram!(
        "cache_sync_operation_seconds",
        "path" => path.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a finished bulk reconciliation.
pub fn record_bulk_run(scanned: usize, written: usize, failed: usize, skipped: usize) {
    counter!("cache_sync_bulk_runs_total").increment(1);
    counter!("cache_sync_bulk_records_scanned_total").increment(scanned as u64);
    counter!("cache_sync_bulk_keys_written_total").increment(written as u64);
    counter!("cache_sync_bulk_keys_failed_total").increment(failed as u64);
    counter!("cache_sync_bulk_duplicates_skipped_total").increment(skipped as u64);
}

/// Record a bulk request refused because the key was busy.
pub fn record_bulk_conflict() {
    counter!("cache_sync_bulk_conflicts_total").increment(1);
}

/// Record an event deferred behind a running bulk reconciliation.
pub fn record_deferred_event() {
    counter!("cache_sync_deferred_events_total").increment(1);
}

/// Record events replayed from a deferral queue.
pub fn record_drained_events(count: usize) {
    counter!("cache_sync_drained_events_total").increment(count as u64);
}

/// Set the total number of deferred events waiting across all keys.
pub fn set_queue_depth(depth: usize) {
    gauge!("cache_sync_pending_queue_depth").set(depth as f64);
}

/// Set the number of keys with a bulk reconciliation in progress.
pub fn set_active_bulk_runs(count: usize) {
    gauge!("cache_sync_active_bulk_runs").set(count as f64);
}

/// Record a record cached under a synthetic identifier.
pub fn record_synthetic_id() {
    counter!("cache_sync_synthetic_ids_total").increment(1);
}

/// Record a maintenance action (renumbered or purged chunk).
pub fn record_maintenance(job: &str, count: usize) {
    counter!(
        "cache_sync_maintenance_actions_total",
        "job" => job.to_string()
    )
    .increment(count as u64);
}

/// Record an error by path and kind.
pub fn record_error(path: &str, operation: &str, kind: &str) {
    counter!(
        "cache_sync_errors_total",
        "path" => path.to_string(),
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop.
pub struct LatencyTimer {
    path: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer.
    pub fn new(path: &'static str, operation: &'static str) -> Self {
        Self {
            path,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.path, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder installed: every call must be a cheap no-op.
    #[test]
    fn test_calls_without_recorder_do_not_panic() {
        record_operation("incremental", "insert", "success");
        record_bulk_run(10, 5, 0, 5);
        record_bulk_conflict();
        record_deferred_event();
        record_drained_events(3);
        set_queue_depth(3);
        set_active_bulk_runs(1);
        record_synthetic_id();
        record_maintenance("renumber", 2);
        record_error("bulk", "write", "backend");
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let timer = LatencyTimer::new("bulk", "reconcile");
        std::thread::sleep(Duration::from_millis(1));
        drop(timer);
    }

    #[test]
    fn test_bulk_run_counters_are_labelled() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            record_bulk_run(7, 3, 1, 2);
            record_operation("incremental", "remove", "not_found");
        });

        let counters: Vec<(String, Vec<String>, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(v) => {
                    let key = key.key();
                    let labels = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
                    Some((key.name().to_string(), labels, v))
                }
                _ => None,
            })
            .collect();

        let find = |name: &str| counters.iter().find(|(n, _, _)| n == name).map(|(_, l, v)| (l.clone(), *v));
        assert_eq!(find("cache_sync_bulk_records_scanned_total"), Some((vec![], 7)));
        assert_eq!(find("cache_sync_bulk_duplicates_skipped_total"), Some((vec![], 2)));
        let (labels, count) = find("cache_sync_operations_total").unwrap();
        assert_eq!(count, 1);
        assert!(labels.contains(&"status=not_found".to_string()));
    }
}
