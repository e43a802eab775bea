// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Errors surfaced by the sync operations.
///
/// Per-record failures inside a bulk run or a single event application are
/// never raised as `SyncError`; they are folded into the operation's result.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing or malformed input. Not retryable.
    #[error("Invalid request: {0}")]
    Validation(String),
    /// A bulk reconciliation already holds the key.
    #[error("Operation already in progress for '{0}'")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// A store was unreachable before the operation started.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
