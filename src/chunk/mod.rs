// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entries and chunk read-modify-write helpers.
//!
//! A target with `items_per_key == 1` stores one record per key; anything
//! larger packs records into `chunk:<n>` keys holding a JSON array. The
//! shape is decided by the target, never guessed from a stored value.
//!
//! # Invariants
//!
//! - A chunk never holds more than `items_per_key` records.
//! - An empty chunk is deleted, not written as `[]`.
//! - Chunk ids need not be contiguous.

pub mod allocator;

pub use allocator::{Allocation, ChunkAllocator, Placement};

use serde_json::Value;
use tracing::warn;

use crate::record::{has_id, Record};
use crate::storage::traits::{CacheStore, StorageError};
use crate::target::{CacheTarget, EntryShape};

/// A decoded cache value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Single(Record),
    Chunk(Vec<Record>),
}

impl CacheEntry {
    /// Decode `raw` according to the target's shape.
    pub fn decode(shape: EntryShape, key: &str, raw: &str) -> Result<Self, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt { key: key.to_string(), reason };
        let value: Value = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
        match (shape, value) {
            (EntryShape::Single, Value::Object(record)) => Ok(Self::Single(record)),
            (EntryShape::Chunk { .. }, Value::Array(values)) => values
                .into_iter()
                .map(|v| match v {
                    Value::Object(record) => Ok(record),
                    other => Err(corrupt(format!("chunk element is not an object: {}", other))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Chunk),
            (EntryShape::Single, _) => Err(corrupt("expected a JSON object".to_string())),
            (EntryShape::Chunk { .. }, _) => Err(corrupt("expected a JSON array".to_string())),
        }
    }

    /// Serialize back to the stored JSON form.
    pub fn encode(&self) -> Result<String, StorageError> {
        match self {
            Self::Single(record) => serde_json::to_string(record),
            Self::Chunk(records) => serde_json::to_string(records),
        }
        .map_err(|e| StorageError::Backend(e.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Chunk(records) => records.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One loaded chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSlot {
    pub id: u64,
    pub key: String,
    pub items: Vec<Record>,
}

/// Everything a mutation needs to know about a target's chunks, from one pass.
#[derive(Debug, Default)]
pub struct Survey {
    /// Chunk keys seen, including unreadable ones.
    pub chunk_count: usize,
    /// Chunk holding the requested id, and its position in that chunk.
    pub holder: Option<(ChunkSlot, usize)>,
    /// Fullest chunk that still has room.
    pub best_fit: Option<ChunkSlot>,
    /// `max(existing ids) + 1`, or 0 when there are no chunks.
    pub next_id: u64,
}

/// What happened to a chunk key after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Written,
    Deleted,
}

/// Chunk operations scoped to one target.
pub struct Chunks<'a> {
    store: &'a dyn CacheStore,
    target: &'a CacheTarget,
}

impl<'a> Chunks<'a> {
    pub fn new(store: &'a dyn CacheStore, target: &'a CacheTarget) -> Self {
        Self { store, target }
    }

    fn capacity(&self) -> usize {
        self.target.items_per_key.max(1)
    }

    /// Chunk keys of the target with their numeric ids, ascending by id.
    pub async fn keys(&self) -> Result<Vec<(u64, String)>, StorageError> {
        let mut keys: Vec<(u64, String)> = self
            .store
            .scan_keys(&self.target.chunk_pattern())
            .await?
            .into_iter()
            .filter_map(|key| self.target.chunk_id_of(&key).map(|id| (id, key)))
            .collect();
        keys.sort_by_key(|(id, _)| *id);
        Ok(keys)
    }

    /// Records of a chunk, `None` if the key doesn't exist.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<Record>>, StorageError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match CacheEntry::decode(self.target.shape(), key, &raw)? {
            CacheEntry::Chunk(items) => Ok(Some(items)),
            CacheEntry::Single(record) => Ok(Some(vec![record])),
        }
    }

    /// Rewrite a chunk's full value; an empty chunk is deleted instead.
    pub async fn store_items(&self, key: &str, items: &[Record]) -> Result<ChunkWrite, StorageError> {
        if items.is_empty() {
            self.store.delete(key).await?;
            return Ok(ChunkWrite::Deleted);
        }
        let raw = serde_json::to_string(items).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.store.set(key, &raw, self.target.ttl()).await?;
        Ok(ChunkWrite::Written)
    }

    /// Read every chunk once, locating `id` and the best-fit chunk.
    ///
    /// Unreadable chunks are logged and treated as full; they still count
    /// towards `next_id` so a fresh chunk never lands on their key.
    pub async fn survey(&self, id: Option<&str>) -> Result<Survey, StorageError> {
        let capacity = self.capacity();
        let mut survey = Survey::default();
        let mut max_id: Option<u64> = None;

        for (chunk_id, key) in self.keys().await? {
            survey.chunk_count += 1;
            max_id = Some(max_id.map_or(chunk_id, |m| m.max(chunk_id)));

            let items = match self.load(&key).await {
                Ok(Some(items)) => items,
                // Deleted between SCAN and GET.
                Ok(None) => continue,
                Err(StorageError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Skipping unreadable chunk");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if survey.holder.is_none() {
                if let Some(id) = id {
                    if let Some(pos) = items.iter().position(|r| has_id(r, id)) {
                        survey.holder = Some((
                            ChunkSlot { id: chunk_id, key: key.clone(), items: items.clone() },
                            pos,
                        ));
                    }
                }
            }

            let len = items.len();
            let better = len < capacity
                && survey.best_fit.as_ref().map_or(true, |best| len > best.items.len());
            if better {
                survey.best_fit = Some(ChunkSlot { id: chunk_id, key, items });
            }
        }

        survey.next_id = max_id.map_or(0, |m| m.saturating_add(1));
        Ok(survey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryCacheStore;
    use serde_json::json;

    fn rec(id: &str) -> Record {
        json!({"id": id}).as_object().cloned().unwrap()
    }

    async fn seed(store: &InMemoryCacheStore, key: &str, ids: &[&str]) {
        let items: Vec<Record> = ids.iter().map(|id| rec(id)).collect();
        store.set(key, &serde_json::to_string(&items).unwrap(), None).await.unwrap();
    }

    #[test]
    fn test_decode_by_shape() {
        let single = CacheEntry::decode(EntryShape::Single, "k", r#"{"id":"a"}"#).unwrap();
        assert_eq!(single.len(), 1);

        let chunk = CacheEntry::decode(EntryShape::Chunk { capacity: 3 }, "k", r#"[{"id":"a"},{"id":"b"}]"#).unwrap();
        assert_eq!(chunk, CacheEntry::Chunk(vec![rec("a"), rec("b")]));

        assert!(CacheEntry::decode(EntryShape::Chunk { capacity: 3 }, "k", r#"{"id":"a"}"#).is_err());
        assert!(CacheEntry::decode(EntryShape::Single, "k", r#"[1]"#).is_err());
        assert!(CacheEntry::decode(EntryShape::Chunk { capacity: 3 }, "k", r#"[1]"#).is_err());
        assert!(CacheEntry::decode(EntryShape::Single, "k", "not json").is_err());

        assert_eq!(single.encode().unwrap(), r#"{"id":"a"}"#);
        assert_eq!(chunk.encode().unwrap(), r#"[{"id":"a"},{"id":"b"}]"#);
    }

    #[tokio::test]
    async fn test_survey_empty_target() {
        let store = InMemoryCacheStore::new();
        let target = CacheTarget::new("p", "t", 3);
        let survey = Chunks::new(&store, &target).survey(Some("a")).await.unwrap();
        assert_eq!(survey.chunk_count, 0);
        assert!(survey.holder.is_none());
        assert!(survey.best_fit.is_none());
        assert_eq!(survey.next_id, 0);
    }

    #[tokio::test]
    async fn test_survey_prefers_fullest_open_chunk() {
        let store = InMemoryCacheStore::new();
        let target = CacheTarget::new("p", "t", 3);
        seed(&store, "p:t:chunk:0", &["a"]).await;
        seed(&store, "p:t:chunk:1", &["b", "c"]).await;
        seed(&store, "p:t:chunk:2", &["d", "e", "f"]).await;
        seed(&store, "p:t:chunk:7", &["g", "h"]).await;

        let survey = Chunks::new(&store, &target).survey(Some("e")).await.unwrap();
        assert_eq!(survey.chunk_count, 4);
        assert_eq!(survey.next_id, 8);

        // Ties go to the lowest id.
        let best = survey.best_fit.unwrap();
        assert_eq!(best.key, "p:t:chunk:1");

        let (holder, pos) = survey.holder.unwrap();
        assert_eq!(holder.key, "p:t:chunk:2");
        assert_eq!(pos, 1);
    }

    #[tokio::test]
    async fn test_survey_skips_corrupt_chunk_but_counts_its_id() {
        let store = InMemoryCacheStore::new();
        let target = CacheTarget::new("p", "t", 3);
        store.set("p:t:chunk:4", "garbage", None).await.unwrap();

        let survey = Chunks::new(&store, &target).survey(None).await.unwrap();
        assert!(survey.best_fit.is_none());
        assert_eq!(survey.next_id, 5);
    }

    #[tokio::test]
    async fn test_store_items_deletes_empty_chunk() {
        let store = InMemoryCacheStore::new();
        let target = CacheTarget::new("p", "t", 3).with_ttl(120);
        let chunks = Chunks::new(&store, &target);

        assert_eq!(chunks.store_items("p:t:chunk:0", &[rec("a")]).await.unwrap(), ChunkWrite::Written);
        assert!(store.ttl_of("p:t:chunk:0").is_some());

        assert_eq!(chunks.store_items("p:t:chunk:0", &[]).await.unwrap(), ChunkWrite::Deleted);
        assert!(store.get("p:t:chunk:0").await.unwrap().is_none());
    }
}
