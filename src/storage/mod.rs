// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: the cache, the mirrored source tables and the
//! configuration table.

pub mod traits;
pub mod redis;
pub mod sql;
pub mod memory;
