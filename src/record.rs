// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source records and identifier extraction.
//!
//! Records are plain JSON objects. Change-feed producers may deliver them
//! with every attribute wrapped in a single-key type tag:
//!
//! ```text
//! plain:    {"id": "a1", "name": "Widget", "qty": 3}
//! wrapped:  {"id": {"S": "a1"}, "name": {"S": "Widget"}, "qty": {"N": "3"}}
//! ```
//!
//! Identifiers are found by trying [`ID_STRATEGIES`] in order. When none
//! matches, a synthetic time-derived id is issued so the record can still be
//! cached; those ids are logged and counted for later migration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tracing::warn;

/// A source record: a flat-ish JSON object.
pub type Record = Map<String, Value>;

/// Ordered extraction strategies: every plain field first, then every wrapped field.
pub const ID_STRATEGIES: [IdStrategy; 10] = [
    IdStrategy::Plain("id"),
    IdStrategy::Plain("pk"),
    IdStrategy::Plain("PK"),
    IdStrategy::Plain("Id"),
    IdStrategy::Plain("ID"),
    IdStrategy::Wrapped("id"),
    IdStrategy::Wrapped("pk"),
    IdStrategy::Wrapped("PK"),
    IdStrategy::Wrapped("Id"),
    IdStrategy::Wrapped("ID"),
];

static SYNTHETIC_SEQ: AtomicU64 = AtomicU64::new(0);

/// A single-attribute wrapped value as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    S(String),
    N(String),
    Bool(bool),
    Null,
}

impl Attribute {
    /// Recognise `{"S": ..}`, `{"N": ..}`, `{"BOOL": ..}` and `{"NULL": true}`.
    #[must_use]
    pub fn from_wrapped(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let (tag, inner) = obj.iter().next()?;
        match (tag.as_str(), inner) {
            ("S", Value::String(s)) => Some(Self::S(s.clone())),
            ("N", Value::String(n)) => Some(Self::N(n.clone())),
            ("N", Value::Number(n)) => Some(Self::N(n.to_string())),
            ("BOOL", Value::Bool(b)) => Some(Self::Bool(*b)),
            ("NULL", Value::Bool(true)) => Some(Self::Null),
            _ => None,
        }
    }

    /// Value usable as a cache key suffix (strings and numbers only).
    #[must_use]
    pub fn as_key(&self) -> Option<String> {
        match self {
            Self::S(s) if !s.is_empty() => Some(s.clone()),
            Self::N(n) if !n.is_empty() => Some(n.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_plain(self) -> Value {
        match self {
            Self::S(s) => Value::String(s),
            Self::N(n) => n
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| n.parse::<f64>().map(Value::from))
                .unwrap_or(Value::String(n)),
            Self::Bool(b) => Value::Bool(b),
            Self::Null => Value::Null,
        }
    }
}

/// One way of pulling an identifier out of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// `{"id": "a1"}` or `{"id": 42}`
    Plain(&'static str),
    /// `{"id": {"S": "a1"}}`
    Wrapped(&'static str),
}

impl IdStrategy {
    #[must_use]
    pub fn extract(&self, record: &Record) -> Option<String> {
        match self {
            Self::Plain(field) => match record.get(*field)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
            Self::Wrapped(field) => Attribute::from_wrapped(record.get(*field)?)?.as_key(),
        }
    }
}

/// Identifier resolved for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordId {
    Found { value: String, via: IdStrategy },
    /// No identifier field present; issued from the clock.
    Synthetic(String),
}

impl RecordId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Found { value, .. } => value,
            Self::Synthetic(value) => value,
        }
    }

    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }

    #[must_use]
    pub fn into_string(self) -> String {
        match self {
            Self::Found { value, .. } => value,
            Self::Synthetic(value) => value,
        }
    }
}

/// First identifier any strategy can extract, without the synthetic fallback.
#[must_use]
pub fn find_id(record: &Record) -> Option<RecordId> {
    ID_STRATEGIES.iter().find_map(|strategy| {
        strategy
            .extract(record)
            .map(|value| RecordId::Found { value, via: *strategy })
    })
}

/// Identifier of `record`, falling back to a synthetic id.
pub fn extract_id(record: &Record) -> RecordId {
    if let Some(id) = find_id(record) {
        return id;
    }
    let id = synthetic_id();
    warn!(synthetic_id = %id, fields = ?record.keys().collect::<Vec<_>>(), "Record has no identifier field, using synthetic id");
    crate::metrics::record_synthetic_id();
    RecordId::Synthetic(id)
}

/// Does `record` carry the identifier `id`?
#[must_use]
pub fn has_id(record: &Record, id: &str) -> bool {
    find_id(record).is_some_and(|found| found.as_str() == id)
}

/// Unwrap every single-attribute wrapped value into its plain form.
#[must_use]
pub fn normalize(record: Record) -> Record {
    record
        .into_iter()
        .map(|(field, value)| match Attribute::from_wrapped(&value) {
            Some(attr) => (field, attr.into_plain()),
            None => (field, value),
        })
        .collect()
}

fn synthetic_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = SYNTHETIC_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("synthetic-{}-{}", millis, seq)
}
