// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental synchronization: apply one change event to the cache.
//!
//! | event  | single entry          | chunked entry                                  |
//! |--------|-----------------------|------------------------------------------------|
//! | INSERT | overwrite key         | replace if cached, else best-fit append        |
//! | MODIFY | overwrite key         | replace in place, else insert (late create)    |
//! | REMOVE | delete key            | splice out, delete chunk when it becomes empty |
//!
//! Every outcome, including store failures, comes back as an [`ApplyResult`]
//! so one bad target never hides the others.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::chunk::{CacheEntry, ChunkAllocator, ChunkWrite, Chunks, Placement};
use crate::error::SyncError;
use crate::events::{ApplyAction, ApplyResult, ChangeEvent, EventType};
use crate::metrics;
use crate::record::{find_id, normalize, Record};
use crate::resolver::ConfigResolver;
use crate::storage::traits::{CacheStore, StorageError};
use crate::target::{CacheTarget, EntryShape};

/// Why an apply did not succeed, before it is flattened into an [`ApplyResult`].
enum ApplyFailure {
    Invalid(String),
    Store(StorageError),
}

impl From<StorageError> for ApplyFailure {
    fn from(e: StorageError) -> Self {
        Self::Store(e)
    }
}

pub struct IncrementalSynchronizer {
    cache: Arc<dyn CacheStore>,
    allocator: ChunkAllocator,
    resolver: ConfigResolver,
}

impl IncrementalSynchronizer {
    pub fn new(cache: Arc<dyn CacheStore>, resolver: ConfigResolver) -> Self {
        Self {
            allocator: ChunkAllocator::new(cache.clone()),
            cache,
            resolver,
        }
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Apply `event` to every active target mirroring its table.
    ///
    /// Fails only when the targets can't be resolved.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<Vec<ApplyResult>, SyncError> {
        let targets = self.resolver.targets_for_table(&event.table_name).await?;
        if targets.is_empty() {
            debug!(table = %event.table_name, "No active target for table, event ignored");
        }
        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            results.push(self.apply_change(target, event).await);
        }
        Ok(results)
    }

    pub async fn apply_change(&self, target: &CacheTarget, event: &ChangeEvent) -> ApplyResult {
        self.apply(target, event.event_type, event.new_item.as_ref(), event.old_item.as_ref())
            .await
    }

    /// Apply one event to one target.
    #[tracing::instrument(skip(self, target, new_item, old_item), fields(target = %target.id))]
    pub async fn apply(
        &self,
        target: &CacheTarget,
        event_type: EventType,
        new_item: Option<&Record>,
        old_item: Option<&Record>,
    ) -> ApplyResult {
        let _timer = metrics::LatencyTimer::new("incremental", "apply");
        let outcome = match event_type {
            EventType::Insert => self.insert(target, new_item).await,
            EventType::Modify => self.modify(target, new_item, old_item).await,
            EventType::Remove => self.remove(target, old_item).await,
        };

        let base = |success: bool, action: ApplyAction, cache_key: Option<String>, error: Option<String>| ApplyResult {
            target_id: target.id.clone(),
            project: target.project.clone(),
            table: target.table_name.clone(),
            success,
            action,
            cache_key,
            error,
        };

        match outcome {
            Ok((ApplyAction::NotFound, key)) => {
                debug!(event = %event_type, "Record not cached, nothing to remove");
                metrics::record_operation("incremental", event_type.label(), "not_found");
                base(false, ApplyAction::NotFound, key, Some("record not found in cache".to_string()))
            }
            Ok((action, key)) => {
                debug!(event = %event_type, ?action, key = ?key, "Applied change");
                metrics::record_operation("incremental", event_type.label(), "success");
                base(true, action, key, None)
            }
            Err(ApplyFailure::Invalid(message)) => {
                warn!(event = %event_type, error = %message, "Rejected change event");
                metrics::record_operation("incremental", event_type.label(), "invalid");
                base(false, ApplyAction::Failed, None, Some(message))
            }
            Err(ApplyFailure::Store(e)) => {
                warn!(event = %event_type, error = %e, "Failed to apply change");
                metrics::record_operation("incremental", event_type.label(), "error");
                metrics::record_error("incremental", event_type.label(), "storage");
                base(false, ApplyAction::Failed, None, Some(e.to_string()))
            }
        }
    }

    async fn insert(&self, target: &CacheTarget, new_item: Option<&Record>) -> Result<(ApplyAction, Option<String>), ApplyFailure> {
        let record = new_item
            .cloned()
            .map(normalize)
            .ok_or_else(|| ApplyFailure::Invalid("INSERT requires newItem".to_string()))?;

        Ok(match self.allocator.place(target, record).await? {
            Placement::Replaced { key } => (ApplyAction::Replaced, Some(key)),
            Placement::Appended { key } | Placement::Created { key } => (ApplyAction::Inserted, Some(key)),
        })
    }

    async fn modify(
        &self,
        target: &CacheTarget,
        new_item: Option<&Record>,
        old_item: Option<&Record>,
    ) -> Result<(ApplyAction, Option<String>), ApplyFailure> {
        let mut record = new_item
            .cloned()
            .map(normalize)
            .ok_or_else(|| ApplyFailure::Invalid("MODIFY requires newItem".to_string()))?;

        let id = match find_id(&record) {
            Some(id) => id.into_string(),
            None => {
                let id = old_item
                    .and_then(find_id)
                    .ok_or_else(|| ApplyFailure::Invalid("MODIFY event carries no record identifier".to_string()))?
                    .into_string();
                // Keep the record findable by the id it is cached under.
                record.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        match target.shape() {
            EntryShape::Single => {
                let key = target.single_key(&id);
                let raw = CacheEntry::Single(record).encode()?;
                self.cache.set(&key, &raw, target.ttl()).await?;
                Ok((ApplyAction::Replaced, Some(key)))
            }
            EntryShape::Chunk { .. } => {
                let chunks = Chunks::new(self.cache.as_ref(), target);
                let survey = chunks.survey(Some(&id)).await?;
                match survey.holder {
                    Some((mut slot, pos)) => {
                        slot.items[pos] = record;
                        chunks.store_items(&slot.key, &slot.items).await?;
                        Ok((ApplyAction::Replaced, Some(slot.key)))
                    }
                    None => {
                        debug!(id = %id, "MODIFY for uncached record, inserting");
                        let placement = self.allocator.place(target, record).await?;
                        Ok((ApplyAction::InsertedOnModify, Some(placement.key().to_string())))
                    }
                }
            }
        }
    }

    async fn remove(&self, target: &CacheTarget, old_item: Option<&Record>) -> Result<(ApplyAction, Option<String>), ApplyFailure> {
        let old = old_item.ok_or_else(|| ApplyFailure::Invalid("REMOVE requires oldItem".to_string()))?;
        // A synthetic id never matches a cached record.
        let Some(id) = find_id(old).map(|id| id.into_string()) else {
            debug!("REMOVE without record identifier, nothing to delete");
            return Ok((ApplyAction::NotFound, None));
        };

        match target.shape() {
            EntryShape::Single => {
                let key = target.single_key(&id);
                if self.cache.delete(&key).await? == 0 {
                    Ok((ApplyAction::NotFound, None))
                } else {
                    Ok((ApplyAction::Removed, Some(key)))
                }
            }
            EntryShape::Chunk { .. } => {
                let chunks = Chunks::new(self.cache.as_ref(), target);
                let Some((mut slot, pos)) = chunks.survey(Some(&id)).await?.holder else {
                    return Ok((ApplyAction::NotFound, None));
                };
                slot.items.remove(pos);
                let action = match chunks.store_items(&slot.key, &slot.items).await? {
                    ChunkWrite::Written => ApplyAction::Removed,
                    ChunkWrite::Deleted => ApplyAction::ChunkDeleted,
                };
                Ok((action, Some(slot.key)))
            }
        }
    }
}
