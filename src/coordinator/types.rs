// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the operation coordinator.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::bulk::ReconcileStats;
use crate::events::{ApplyResult, ChangeEvent};
use crate::target::CacheTarget;

/// Coordination state of one `project:table` key.
///
/// ```text
/// Idle ──begin_bulk──► BulkRunning ──release──► Draining ──queue empty──► Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// No bulk run; events are applied immediately
    Idle,
    /// A bulk run (or maintenance job) holds the key; events are queued
    BulkRunning,
    /// The bulk run is over and its queue is being replayed; events still queue
    Draining,
}

impl std::fmt::Display for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::BulkRunning => write!(f, "BulkRunning"),
            Self::Draining => write!(f, "Draining"),
        }
    }
}

/// An event held back until the key's bulk run ends.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Target resolved when the event arrived
    pub target: CacheTarget,
    pub event: ChangeEvent,
    pub received_at: Instant,
}

/// What happened to an event for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    Applied(ApplyResult),
    Queued {
        #[serde(rename = "targetId")]
        target_id: String,
        project: String,
        table: String,
        /// 1-based position in the key's queue
        position: usize,
    },
}

impl TargetOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Overall disposition of a routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionStatus {
    /// Applied to every target (each result may still report failure)
    Applied,
    /// Deferred for every target
    Queued,
    /// Applied to some targets, deferred for others
    Mixed,
    /// No active target mirrors the table
    NoTargets,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDisposition {
    pub status: DispositionStatus,
    pub outcomes: Vec<TargetOutcome>,
}

impl EventDisposition {
    pub(crate) fn from_outcomes(outcomes: Vec<TargetOutcome>) -> Self {
        let queued = outcomes.iter().filter(|o| o.is_queued()).count();
        let status = match (outcomes.len(), queued) {
            (0, _) => DispositionStatus::NoTargets,
            (n, q) if q == n => DispositionStatus::Queued,
            (_, 0) => DispositionStatus::Applied,
            _ => DispositionStatus::Mixed,
        };
        Self { status, outcomes }
    }

    /// True when nothing was applied yet because every target was busy.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.status == DispositionStatus::Queued
    }
}

/// Result of a coordinated bulk run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    #[serde(flatten)]
    pub stats: ReconcileStats,
    /// Events replayed after the run, in arrival order
    pub drained: Vec<ApplyResult>,
}

/// Snapshot of coordinator activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub running: Vec<String>,
    pub draining: Vec<String>,
    /// Queue length per key, only keys with something queued
    pub queued: BTreeMap<String, usize>,
    pub total_queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ApplyAction;

    fn applied() -> TargetOutcome {
        TargetOutcome::Applied(ApplyResult {
            target_id: "p:t".into(),
            project: "p".into(),
            table: "t".into(),
            success: true,
            action: ApplyAction::Inserted,
            cache_key: Some("p:t:a".into()),
            error: None,
        })
    }

    fn queued() -> TargetOutcome {
        TargetOutcome::Queued {
            target_id: "q:t".into(),
            project: "q".into(),
            table: "t".into(),
            position: 1,
        }
    }

    #[test]
    fn test_disposition_status() {
        assert_eq!(EventDisposition::from_outcomes(vec![]).status, DispositionStatus::NoTargets);
        assert_eq!(EventDisposition::from_outcomes(vec![applied()]).status, DispositionStatus::Applied);
        assert_eq!(EventDisposition::from_outcomes(vec![queued()]).status, DispositionStatus::Queued);
        assert_eq!(
            EventDisposition::from_outcomes(vec![applied(), queued()]).status,
            DispositionStatus::Mixed
        );
        assert!(EventDisposition::from_outcomes(vec![queued(), queued()]).is_deferred());
    }

    #[test]
    fn test_outcome_serialization() {
        let v = serde_json::to_value(queued()).unwrap();
        assert_eq!(v["outcome"], "queued");
        assert_eq!(v["targetId"], "q:t");
        assert_eq!(v["position"], 1);

        let v = serde_json::to_value(applied()).unwrap();
        assert_eq!(v["outcome"], "applied");
        assert_eq!(v["cacheKey"], "p:t:a");
    }
}
