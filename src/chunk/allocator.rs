// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Best-fit chunk allocation.
//!
//! For chunked targets a new record goes into the *fullest* chunk that still
//! has room, which keeps the number of partially filled chunks low. Only when
//! every chunk is full is a new one opened at `max(id) + 1`.
//!
//! [`ChunkAllocator::place`] decides and writes in the same call. There is
//! still a window between the read and the write in which another writer can
//! rewrite the same chunk; the later write wins.

use std::sync::Arc;

use tracing::debug;

use super::{CacheEntry, ChunkSlot, Chunks};
use crate::record::{extract_id, Record};
use crate::storage::traits::{CacheStore, StorageError};
use crate::target::{CacheTarget, EntryShape};

/// Where a record should be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub key: String,
    /// Records already stored under `key` (empty for single keys and new chunks).
    pub existing: Vec<Record>,
    pub fresh: bool,
}

/// Result of placing a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Appended to an existing chunk.
    Appended { key: String },
    /// Opened a new chunk, or wrote a single key.
    Created { key: String },
    /// The record id was already cached; replaced in place.
    Replaced { key: String },
}

impl Placement {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Appended { key } | Self::Created { key } | Self::Replaced { key } => key,
        }
    }
}

pub struct ChunkAllocator {
    cache: Arc<dyn CacheStore>,
}

impl ChunkAllocator {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Decide which key `record` belongs in, without writing.
    pub async fn allocate(&self, target: &CacheTarget, record: &Record) -> Result<Allocation, StorageError> {
        match target.shape() {
            EntryShape::Single => Ok(Allocation {
                key: target.single_key(extract_id(record).as_str()),
                existing: Vec::new(),
                fresh: true,
            }),
            EntryShape::Chunk { .. } => {
                let survey = Chunks::new(self.cache.as_ref(), target).survey(None).await?;
                Ok(Self::from_survey(target, survey.best_fit, survey.next_id))
            }
        }
    }

    fn from_survey(target: &CacheTarget, best_fit: Option<ChunkSlot>, next_id: u64) -> Allocation {
        match best_fit {
            Some(slot) => Allocation { key: slot.key, existing: slot.items, fresh: false },
            None => Allocation { key: target.chunk_key(next_id), existing: Vec::new(), fresh: true },
        }
    }

    /// Allocate and write `record` in one read-decide-write pass.
    ///
    /// Single keys are overwritten. In chunk mode a record whose id is already
    /// cached is replaced where it sits, so an id never ends up in two chunks.
    pub async fn place(&self, target: &CacheTarget, record: Record) -> Result<Placement, StorageError> {
        let id = extract_id(&record);

        match target.shape() {
            EntryShape::Single => {
                let key = target.single_key(id.as_str());
                let raw = CacheEntry::Single(record).encode()?;
                self.cache.set(&key, &raw, target.ttl()).await?;
                Ok(Placement::Created { key })
            }
            EntryShape::Chunk { .. } => {
                let chunks = Chunks::new(self.cache.as_ref(), target);
                let survey = chunks.survey(Some(id.as_str())).await?;

                if let Some((mut slot, pos)) = survey.holder {
                    slot.items[pos] = record;
                    chunks.store_items(&slot.key, &slot.items).await?;
                    debug!(key = %slot.key, id = %id.as_str(), "Replaced cached record in place");
                    return Ok(Placement::Replaced { key: slot.key });
                }

                let mut allocation = Self::from_survey(target, survey.best_fit, survey.next_id);
                allocation.existing.push(record);
                chunks.store_items(&allocation.key, &allocation.existing).await?;
                debug!(
                    key = %allocation.key,
                    id = %id.as_str(),
                    len = allocation.existing.len(),
                    fresh = allocation.fresh,
                    "Placed record"
                );
                Ok(if allocation.fresh {
                    Placement::Created { key: allocation.key }
                } else {
                    Placement::Appended { key: allocation.key }
                })
            }
        }
    }
}
