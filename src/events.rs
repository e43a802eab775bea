// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-feed events and per-target apply results.
//!
//! The wire shape follows the change feed:
//!
//! ```json
//! {"type": "MODIFY", "tableName": "products",
//!  "newItem": {"id": {"S": "p1"}, "price": {"N": "9.5"}},
//!  "oldItem": {"id": {"S": "p1"}, "price": {"N": "9"}}}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Modify,
    Remove,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
        }
    }

    /// Lowercase label used in metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Modify => "modify",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "MODIFY" => Ok(Self::Modify),
            "REMOVE" => Ok(Self::Remove),
            other => Err(SyncError::validation(format!(
                "unknown event type '{}', expected INSERT, MODIFY or REMOVE",
                other
            ))),
        }
    }
}

/// A validated change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_item: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_item: Option<Record>,
    pub table_name: String,
}

impl ChangeEvent {
    /// Build an event, checking that the record each type needs is present.
    pub fn new(
        event_type: EventType,
        table_name: impl Into<String>,
        new_item: Option<Record>,
        old_item: Option<Record>,
    ) -> Result<Self, SyncError> {
        let table_name = table_name.into();
        if table_name.trim().is_empty() {
            return Err(SyncError::validation("tableName is required"));
        }
        match event_type {
            EventType::Insert | EventType::Modify if new_item.is_none() => {
                return Err(SyncError::validation(format!("{} requires newItem", event_type)));
            }
            EventType::Remove if old_item.is_none() => {
                return Err(SyncError::validation("REMOVE requires oldItem"));
            }
            _ => {}
        }
        Ok(Self { event_type, new_item, old_item, table_name })
    }

    pub fn insert(table_name: impl Into<String>, item: Record) -> Result<Self, SyncError> {
        Self::new(EventType::Insert, table_name, Some(item), None)
    }

    pub fn modify(table_name: impl Into<String>, new_item: Record, old_item: Option<Record>) -> Result<Self, SyncError> {
        Self::new(EventType::Modify, table_name, Some(new_item), old_item)
    }

    pub fn remove(table_name: impl Into<String>, old_item: Record) -> Result<Self, SyncError> {
        Self::new(EventType::Remove, table_name, None, Some(old_item))
    }
}

/// Change event as received, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventPayload {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub new_item: Option<Value>,
    #[serde(default)]
    pub old_item: Option<Value>,
    #[serde(default)]
    pub table_name: Option<String>,
}

impl TryFrom<ChangeEventPayload> for ChangeEvent {
    type Error = SyncError;

    fn try_from(payload: ChangeEventPayload) -> Result<Self, Self::Error> {
        let event_type: EventType = payload
            .event_type
            .as_deref()
            .ok_or_else(|| SyncError::validation("type is required"))?
            .parse()?;
        let new_item = object_field("newItem", payload.new_item)?;
        let old_item = object_field("oldItem", payload.old_item)?;
        ChangeEvent::new(event_type, payload.table_name.unwrap_or_default(), new_item, old_item)
    }
}

fn object_field(name: &str, value: Option<Value>) -> Result<Option<Record>, SyncError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(record)) => Ok(Some(record)),
        Some(_) => Err(SyncError::validation(format!("{} must be an object", name))),
    }
}

/// What an event did to one target's cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyAction {
    /// Written as a new single key or appended to a chunk.
    Inserted,
    /// Replaced an existing record in place.
    Replaced,
    /// MODIFY for an id not cached anywhere; inserted instead.
    InsertedOnModify,
    /// Removed from a chunk that still holds other records, or single key deleted.
    Removed,
    /// Removed the last record of a chunk; the chunk key is gone.
    ChunkDeleted,
    /// REMOVE for an id not cached anywhere.
    NotFound,
    Failed,
}

/// Outcome of applying one event to one target. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub target_id: String,
    pub project: String,
    pub table: String,
    pub success: bool,
    pub action: ApplyAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> ChangeEventPayload {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!("INSERT".parse::<EventType>().unwrap(), EventType::Insert);
        assert_eq!("REMOVE".parse::<EventType>().unwrap(), EventType::Remove);
        assert!(matches!("UPSERT".parse::<EventType>(), Err(SyncError::Validation(_))));
        assert!("insert".parse::<EventType>().is_err());
    }

    #[test]
    fn test_payload_to_event() {
        let event = ChangeEvent::try_from(payload(json!({
            "type": "MODIFY",
            "tableName": "products",
            "newItem": {"id": {"S": "p1"}},
            "oldItem": {"id": {"S": "p1"}}
        })))
        .unwrap();
        assert_eq!(event.event_type, EventType::Modify);
        assert_eq!(event.table_name, "products");
        assert!(event.old_item.is_some());
    }

    #[test]
    fn test_payload_validation() {
        let missing_type = payload(json!({"tableName": "t", "newItem": {"id": "a"}}));
        assert!(ChangeEvent::try_from(missing_type).is_err());

        let bad_type = payload(json!({"type": "TRUNCATE", "tableName": "t"}));
        assert!(ChangeEvent::try_from(bad_type).is_err());

        let insert_without_new = payload(json!({"type": "INSERT", "tableName": "t", "oldItem": {"id": "a"}}));
        assert!(ChangeEvent::try_from(insert_without_new).is_err());

        let remove_without_old = payload(json!({"type": "REMOVE", "tableName": "t", "newItem": {"id": "a"}}));
        assert!(ChangeEvent::try_from(remove_without_old).is_err());

        let no_table = payload(json!({"type": "INSERT", "newItem": {"id": "a"}}));
        assert!(ChangeEvent::try_from(no_table).is_err());

        let scalar_item = payload(json!({"type": "INSERT", "tableName": "t", "newItem": 5}));
        assert!(ChangeEvent::try_from(scalar_item).is_err());
    }

    #[test]
    fn test_event_serializes_in_feed_shape() {
        let event = ChangeEvent::remove("t", json!({"id": "a"}).as_object().cloned().unwrap()).unwrap();
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "REMOVE");
        assert_eq!(v["tableName"], "t");
        assert!(v.get("newItem").is_none());
    }
}
