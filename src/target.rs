// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache targets (sync configurations) and the cache key layout.
//!
//! ```text
//! single entry:  {project}:{table}:{record id}
//! chunk entry:   {project}:{table}:chunk:{n}
//! ```

use serde::{Deserialize, Serialize};

/// Number of digits from which a chunk suffix is treated as a legacy timestamp id.
pub const TIMESTAMP_CHUNK_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Inactive,
}

impl TargetStatus {
    /// Parse the status column; anything that isn't `active` is inactive.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// How records of a target are laid out in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryShape {
    /// One record per key.
    Single,
    /// Up to `capacity` records per `chunk:<n>` key.
    Chunk { capacity: usize },
}

/// One mirrored source table for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheTarget {
    pub id: String,
    pub project: String,
    pub table_name: String,
    pub items_per_key: usize,
    /// Seconds; 0 means no expiry.
    #[serde(default)]
    pub time_to_live: u64,
    pub status: TargetStatus,
}

impl CacheTarget {
    /// Active target with no expiry, identified by `project:table`.
    pub fn new(project: impl Into<String>, table_name: impl Into<String>, items_per_key: usize) -> Self {
        let project = project.into();
        let table_name = table_name.into();
        Self {
            id: format!("{}:{}", project, table_name),
            project,
            table_name,
            items_per_key,
            time_to_live: 0,
            status: TargetStatus::Active,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.time_to_live = ttl_secs;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TargetStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }

    /// `items_per_key >= 1` and non-empty names.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.items_per_key >= 1 && !self.project.is_empty() && !self.table_name.is_empty()
    }

    #[must_use]
    pub fn shape(&self) -> EntryShape {
        if self.items_per_key <= 1 {
            EntryShape::Single
        } else {
            EntryShape::Chunk { capacity: self.items_per_key }
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Option<u64> {
        (self.time_to_live > 0).then_some(self.time_to_live)
    }

    /// Coordination key: `project:table`.
    #[must_use]
    pub fn lock_key(&self) -> String {
        lock_key(&self.project, &self.table_name)
    }

    /// `project:table:`
    #[must_use]
    pub fn key_prefix(&self) -> String {
        format!("{}:{}:", self.project, self.table_name)
    }

    #[must_use]
    pub fn single_key(&self, record_id: &str) -> String {
        format!("{}{}", self.key_prefix(), record_id)
    }

    #[must_use]
    pub fn chunk_key(&self, chunk_id: u64) -> String {
        format!("{}chunk:{}", self.key_prefix(), chunk_id)
    }

    #[must_use]
    pub fn chunk_pattern(&self) -> String {
        format!("{}chunk:*", self.key_prefix())
    }

    /// Every key belonging to this target.
    #[must_use]
    pub fn all_keys_pattern(&self) -> String {
        format!("{}*", self.key_prefix())
    }

    /// Numeric suffix of a chunk key of this target.
    #[must_use]
    pub fn chunk_id_of(&self, key: &str) -> Option<u64> {
        self.chunk_suffix_of(key)?.parse().ok()
    }

    /// Raw suffix of a chunk key of this target, digits only.
    #[must_use]
    pub fn chunk_suffix_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let suffix = key
            .strip_prefix(self.key_prefix().as_str())?
            .strip_prefix("chunk:")?;
        (!suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())).then_some(suffix)
    }
}

/// Coordination key for a (project, table) pair.
#[must_use]
pub fn lock_key(project: &str, table: &str) -> String {
    format!("{}:{}", project, table)
}

/// A chunk suffix produced by the retired timestamp numbering scheme.
#[must_use]
pub fn is_timestamp_suffix(suffix: &str) -> bool {
    suffix.len() >= TIMESTAMP_CHUNK_DIGITS && suffix.bytes().all(|b| b.is_ascii_digit())
}
