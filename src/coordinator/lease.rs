// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Guard over a claimed `project:table` key.

use tokio::runtime::Handle;
use tracing::{error, warn};

use super::OperationCoordinator;
use crate::events::ApplyResult;

/// Held for the duration of a bulk run or maintenance job.
///
/// Call [`release`](Self::release) to free the key and replay its queue.
/// A lease dropped without release still frees the key; the drain is
/// spawned onto the current runtime.
#[must_use = "dropping a lease releases the key immediately"]
pub struct BulkLease {
    coordinator: OperationCoordinator,
    key: String,
    released: bool,
}

impl BulkLease {
    pub(super) fn new(coordinator: OperationCoordinator, key: String) -> Self {
        Self {
            coordinator,
            key,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Free the key and replay deferred events, returning their results in order.
    pub async fn release(mut self) -> Vec<ApplyResult> {
        self.released = true;
        self.coordinator.end_bulk(&self.key).await
    }
}

impl Drop for BulkLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let coordinator = self.coordinator.clone();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, "Lease dropped without release, draining in background");
                handle.spawn(async move {
                    coordinator.end_bulk(&key).await;
                });
            }
            Err(_) => {
                let dropped = coordinator.abandon(&key);
                error!(key = %key, dropped, "Lease dropped outside a runtime, deferred events discarded");
            }
        }
    }
}
