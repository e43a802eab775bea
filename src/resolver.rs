// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lookup of active sync configurations.

use std::sync::Arc;

use tracing::warn;

use crate::error::SyncError;
use crate::storage::traits::TargetCatalog;
use crate::target::CacheTarget;

/// Answers "where does this table's data go?" from the configuration table.
///
/// The catalog is read on every call; it is small and operators edit it
/// without restarting the service.
#[derive(Clone)]
pub struct ConfigResolver {
    catalog: Arc<dyn TargetCatalog>,
}

impl ConfigResolver {
    pub fn new(catalog: Arc<dyn TargetCatalog>) -> Self {
        Self { catalog }
    }

    /// Every active target.
    pub async fn active_targets(&self) -> Result<Vec<CacheTarget>, SyncError> {
        Ok(self
            .catalog
            .list_targets()
            .await?
            .into_iter()
            .filter(CacheTarget::is_active)
            .collect())
    }

    /// Active, valid targets mirroring `table`. One table may feed several projects.
    pub async fn targets_for_table(&self, table: &str) -> Result<Vec<CacheTarget>, SyncError> {
        let targets = self.active_targets().await?;
        Ok(targets
            .into_iter()
            .filter(|t| t.table_name == table)
            .filter(|t| {
                let valid = t.is_valid();
                if !valid {
                    warn!(target_id = %t.id, items_per_key = t.items_per_key, "Ignoring invalid sync configuration");
                }
                valid
            })
            .collect())
    }

    /// The configured target for one (project, table), active or not.
    pub async fn target_for(&self, project: &str, table: &str) -> Result<Option<CacheTarget>, SyncError> {
        Ok(self
            .catalog
            .list_targets()
            .await?
            .into_iter()
            .find(|t| t.project == project && t.table_name == table))
    }
}
