// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends for tests and single-binary demos.
//!
//! [`InMemoryCacheStore`] behaves like the Redis store (glob `SCAN`, lazy
//! TTL expiry) and can be told to fail writes or go offline so the
//! partial-failure paths can be exercised without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{CacheStore, ScanPage, SourceStore, StorageError, TargetCatalog};
use crate::record::{find_id, Record};
use crate::target::{CacheTarget, TargetStatus};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct InMemoryCacheStore {
    data: DashMap<String, Entry>,
    /// Writes to keys containing any of these substrings fail.
    failing_writes: RwLock<Vec<String>>,
    offline: AtomicBool,
}

impl InMemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            failing_writes: RwLock::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Number of live (unexpired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remaining lifetime of `key`, `None` if it has no expiry or doesn't exist.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entry = self.data.get(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Make every `set` on a key containing `fragment` fail.
    pub fn fail_writes_matching(&self, fragment: impl Into<String>) {
        self.failing_writes.write().push(fragment.into());
    }

    pub fn heal(&self) {
        self.failing_writes.write().clear();
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Simulate a dead connection: every call errors.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Backend("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_online()?;
        let now = Instant::now();
        let expired = match self.data.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError> {
        self.check_online()?;
        if self.failing_writes.read().iter().any(|f| key.contains(f.as_str())) {
            return Err(StorageError::Backend(format!("write rejected for {}", key)));
        }
        // Zero means no expiry, as with Redis SET.
        let expires_at = ttl_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        self.data.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, StorageError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(match self.data.remove(key) {
            Some((_, entry)) if !entry.is_expired(now) => 1,
            _ => 0,
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.check_online()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_online()
    }
}

/// Redis-style glob match supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Source tables held in ordered maps keyed by record id.
pub struct InMemorySourceStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    /// Scans fail once this many pages have been served (usize::MAX = never).
    fail_after_pages: AtomicUsize,
    pages_served: AtomicUsize,
    anonymous_seq: AtomicUsize,
}

impl InMemorySourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fail_after_pages: AtomicUsize::new(usize::MAX),
            pages_served: AtomicUsize::new(0),
            anonymous_seq: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a record. Records without an id are stored under a generated row key.
    pub fn insert(&self, table: &str, record: Record) {
        let row_key = match find_id(&record) {
            Some(id) => id.into_string(),
            None => format!("~row-{:08}", self.anonymous_seq.fetch_add(1, Ordering::SeqCst)),
        };
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(row_key, record);
    }

    pub fn remove(&self, table: &str, id: &str) -> Option<Record> {
        self.tables.write().get_mut(table)?.remove(id)
    }

    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    pub fn fail_scans_after(&self, pages: usize) {
        self.pages_served.store(0, Ordering::SeqCst);
        self.fail_after_pages.store(pages, Ordering::SeqCst);
    }
}

impl Default for InMemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn scan(&self, table: &str, cursor: Option<&str>, limit: usize) -> Result<ScanPage, StorageError> {
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst);
        if served >= self.fail_after_pages.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("scan of {} interrupted", table)));
        }

        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(ScanPage::default());
        };
        let limit = limit.max(1);
        let mut page: Vec<(&String, &Record)> = match cursor {
            Some(after) => rows
                .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit + 1)
                .collect(),
            None => rows.iter().take(limit + 1).collect(),
        };
        let has_more = page.len() > limit;
        page.truncate(limit);
        let next_cursor = if has_more {
            page.last().map(|(k, _)| (*k).clone())
        } else {
            None
        };
        Ok(ScanPage {
            items: page.into_iter().map(|(_, r)| r.clone()).collect(),
            next_cursor,
        })
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.tables.read().get(table).and_then(|rows| rows.get(id).cloned()))
    }
}

pub struct InMemoryTargetCatalog {
    targets: RwLock<Vec<CacheTarget>>,
}

impl InMemoryTargetCatalog {
    #[must_use]
    pub fn new(targets: Vec<CacheTarget>) -> Self {
        Self { targets: RwLock::new(targets) }
    }

    /// Insert or replace by target id.
    pub fn upsert(&self, target: CacheTarget) {
        let mut targets = self.targets.write();
        match targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => targets.push(target),
        }
    }

    pub fn set_status(&self, id: &str, status: TargetStatus) -> bool {
        match self.targets.write().iter_mut().find(|t| t.id == id) {
            Some(target) => {
                target.status = status;
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryTargetCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl TargetCatalog for InMemoryTargetCatalog {
    async fn list_targets(&self) -> Result<Vec<CacheTarget>, StorageError> {
        Ok(self.targets.read().clone())
    }
}
