// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation coordinator.
//!
//! Serializes bulk reconciliation against incremental events per
//! `project:table` key. While a bulk run holds a key, events for it are
//! queued; when the run ends the queue is replayed in arrival order.
//!
//! # Protocol
//!
//! ```text
//! route_event ──► key Idle?      ──yes──► apply now (holds the key's read gate)
//!                     │
//!                     no ─────────────────► push to the key's FIFO queue
//!
//! run_bulk ──► ping cache ──► begin_bulk (Conflict if busy) ──► wait for in-flight applies
//!          ──► reconcile ──► release: Draining, replay queue until empty ──► Idle
//! ```
//!
//! Both maps live behind one `parking_lot::Mutex` that is never held across
//! an `.await`. The per-key `tokio::sync::RwLock` gate lets a starting bulk
//! run wait for events that were already being applied when it began.
//!
//! Coordination is in-process. Several service instances writing the same
//! keyspace would need a lock held in the cache store itself.

mod lease;
mod types;

pub use lease::BulkLease;
pub use types::{
    BulkOutcome, CoordinatorStats, DispositionStatus, EventDisposition, KeyState, PendingEvent,
    TargetOutcome,
};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use crate::bulk::BulkReconciler;
use crate::error::SyncError;
use crate::events::{ApplyResult, ChangeEvent};
use crate::incremental::IncrementalSynchronizer;
use crate::metrics;
use crate::storage::traits::CacheStore;
use crate::target::CacheTarget;

#[derive(Default)]
struct Registry {
    /// Keys that are not idle.
    states: HashMap<String, KeyState>,
    queues: HashMap<String, VecDeque<PendingEvent>>,
    gates: HashMap<String, Arc<RwLock<()>>>,
}

impl Registry {
    fn gate(&mut self, key: &str) -> Arc<RwLock<()>> {
        self.gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn total_queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn running(&self) -> usize {
        self.states.values().filter(|s| **s == KeyState::BulkRunning).count()
    }
}

enum Route {
    Queued(usize),
    Apply(Arc<RwLock<()>>, Option<OwnedRwLockReadGuard<()>>),
}

struct Inner {
    registry: Mutex<Registry>,
    cache: Arc<dyn CacheStore>,
    sync: Arc<IncrementalSynchronizer>,
    reconciler: Arc<BulkReconciler>,
}

/// Cloneable handle; clones share the same lock and queue maps.
#[derive(Clone)]
pub struct OperationCoordinator {
    inner: Arc<Inner>,
}

impl OperationCoordinator {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        sync: Arc<IncrementalSynchronizer>,
        reconciler: Arc<BulkReconciler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                cache,
                sync,
                reconciler,
            }),
        }
    }

    /// Current state of a key.
    #[must_use]
    pub fn state(&self, key: &str) -> KeyState {
        self.inner
            .registry
            .lock()
            .states
            .get(key)
            .copied()
            .unwrap_or(KeyState::Idle)
    }

    #[must_use]
    pub fn queue_len(&self, key: &str) -> usize {
        self.inner.registry.lock().queues.get(key).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        let registry = self.inner.registry.lock();
        let mut stats = CoordinatorStats::default();
        for (key, state) in &registry.states {
            match state {
                KeyState::BulkRunning => stats.running.push(key.clone()),
                KeyState::Draining => stats.draining.push(key.clone()),
                KeyState::Idle => {}
            }
        }
        stats.running.sort();
        stats.draining.sort();
        for (key, queue) in &registry.queues {
            if !queue.is_empty() {
                stats.queued.insert(key.clone(), queue.len());
            }
        }
        stats.total_queued = registry.total_queued();
        stats
    }

    /// Claim `key` for a bulk run. Non-blocking: a busy key is a conflict.
    pub fn begin_bulk(&self, key: &str) -> Result<BulkLease, SyncError> {
        let mut registry = self.inner.registry.lock();
        if let Some(state) = registry.states.get(key) {
            debug!(key = %key, state = %state, "Key busy, refusing bulk run");
            metrics::record_bulk_conflict();
            return Err(SyncError::Conflict(key.to_string()));
        }
        registry.states.insert(key.to_string(), KeyState::BulkRunning);
        metrics::set_active_bulk_runs(registry.running());
        drop(registry);

        info!(key = %key, "Bulk lock acquired");
        Ok(BulkLease::new(self.clone(), key.to_string()))
    }

    /// Wait until events already being applied to `key` have finished.
    ///
    /// Only meaningful while holding a lease; new events queue instead of
    /// taking the read gate.
    pub async fn wait_for_in_flight(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        let gate = self.inner.registry.lock().gate(key);
        gate.write_owned().await
    }

    /// Release `key` and replay its queue in arrival order.
    ///
    /// The key stays `Draining` until a pass over the queue finds it empty,
    /// so events that arrive mid-drain are replayed after the earlier ones.
    pub async fn end_bulk(&self, key: &str) -> Vec<ApplyResult> {
        let mut results = Vec::new();
        loop {
            let batch = {
                let mut registry = self.inner.registry.lock();
                let batch = match registry.queues.remove(key) {
                    Some(queue) if !queue.is_empty() => {
                        registry.states.insert(key.to_string(), KeyState::Draining);
                        Some(queue)
                    }
                    _ => {
                        registry.states.remove(key);
                        None
                    }
                };
                metrics::set_queue_depth(registry.total_queued());
                metrics::set_active_bulk_runs(registry.running());
                batch
            };
            let Some(batch) = batch else { break };

            debug!(key = %key, events = batch.len(), "Replaying deferred events");
            metrics::record_drained_events(batch.len());
            for pending in batch {
                let result = self.inner.sync.apply_change(&pending.target, &pending.event).await;
                if !result.success {
                    warn!(
                        key = %key,
                        event = %pending.event.event_type,
                        waited_ms = pending.received_at.elapsed().as_millis() as u64,
                        error = ?result.error,
                        "Deferred event did not apply cleanly"
                    );
                }
                results.push(result);
            }
        }
        info!(key = %key, replayed = results.len(), "Bulk lock released");
        results
    }

    /// Drop a key's state and queue without replaying. Used when no runtime is left.
    pub(crate) fn abandon(&self, key: &str) -> usize {
        let mut registry = self.inner.registry.lock();
        registry.states.remove(key);
        let dropped = registry.queues.remove(key).map_or(0, |q| q.len());
        metrics::set_queue_depth(registry.total_queued());
        metrics::set_active_bulk_runs(registry.running());
        dropped
    }

    /// Route a change event to every target mirroring its table.
    ///
    /// Per target: queued if the key is busy, applied immediately otherwise.
    pub async fn route_event(&self, event: ChangeEvent) -> Result<EventDisposition, SyncError> {
        let targets = self.inner.sync.resolver().targets_for_table(&event.table_name).await?;
        let mut outcomes = Vec::with_capacity(targets.len());

        for target in targets {
            let key = target.lock_key();
            let route = {
                let mut registry = self.inner.registry.lock();
                if registry.states.contains_key(&key) {
                    let queue = registry.queues.entry(key.clone()).or_default();
                    queue.push_back(PendingEvent {
                        target: target.clone(),
                        event: event.clone(),
                        received_at: Instant::now(),
                    });
                    let position = queue.len();
                    metrics::set_queue_depth(registry.total_queued());
                    Route::Queued(position)
                } else {
                    let gate = registry.gate(&key);
                    let guard = gate.clone().try_read_owned().ok();
                    Route::Apply(gate, guard)
                }
            };

            match route {
                Route::Queued(position) => {
                    debug!(key = %key, position, event = %event.event_type, "Bulk run in progress, event queued");
                    metrics::record_deferred_event();
                    metrics::record_operation("incremental", event.event_type.label(), "queued");
                    outcomes.push(TargetOutcome::Queued {
                        target_id: target.id.clone(),
                        project: target.project.clone(),
                        table: target.table_name.clone(),
                        position,
                    });
                }
                Route::Apply(gate, guard) => {
                    let _guard = match guard {
                        Some(guard) => guard,
                        None => gate.read_owned().await,
                    };
                    let result = self.inner.sync.apply_change(&target, &event).await;
                    outcomes.push(TargetOutcome::Applied(result));
                }
            }
        }

        Ok(EventDisposition::from_outcomes(outcomes))
    }

    /// Run `job` while holding `key` exclusively, then replay the queue.
    ///
    /// The key is released even when `job` fails.
    pub async fn run_exclusive<F, Fut, T>(&self, key: &str, job: F) -> Result<(T, Vec<ApplyResult>), SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let lease = self.begin_bulk(key)?;
        let gate = self.wait_for_in_flight(key).await;
        let result = job().await;
        drop(gate);
        let drained = lease.release().await;
        result.map(|value| (value, drained))
    }

    /// Reconcile a target's table into the cache under the key's lease.
    ///
    /// The cache is probed first; if it is unreachable the key is never claimed.
    pub async fn run_bulk(&self, target: &CacheTarget) -> Result<BulkOutcome, SyncError> {
        if !target.is_valid() {
            return Err(SyncError::validation("recordsPerKey must be >= 1 and project/table non-empty"));
        }
        if let Err(e) = self.inner.cache.ping().await {
            warn!(error = %e, "Cache unreachable, bulk run not started");
            return Err(SyncError::Unavailable(e.to_string()));
        }

        let reconciler = self.inner.reconciler.clone();
        let (stats, drained) = self
            .run_exclusive(&target.lock_key(), || async move { reconciler.reconcile(target).await })
            .await?;
        Ok(BulkOutcome { stats, drained })
    }
}
