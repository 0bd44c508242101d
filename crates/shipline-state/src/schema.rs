//! Database row shapes for the SurrealDB backend.
//!
//! The full [`RunEntry`] is stored as a JSON document string next to the
//! handful of scalar columns the indexes and queries need. Keeping the entry
//! opaque to the database means schema changes in `RunEntry` never require a
//! migration.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{RunEntry, StorageResult};

/// Row in the `pipeline_runs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    /// Unique run ID (UUID string)
    pub run_id: String,
    /// Pipeline definition name
    pub pipeline: String,
    /// `succeeded` | `failed` | `denied`
    pub outcome: String,
    /// Terminal timestamp in epoch milliseconds, used for ordering
    pub finished_at_ms: i64,
    /// Serialized `RunEntry`
    pub entry: String,
}

impl RunRow {
    pub fn from_entry(entry: &RunEntry) -> StorageResult<Self> {
        Ok(RunRow {
            run_id: entry.run_id.0.clone(),
            pipeline: entry.pipeline.clone(),
            outcome: entry.outcome.to_string(),
            finished_at_ms: entry.finished_at.timestamp_millis(),
            entry: serde_json::to_string(entry)?,
        })
    }

    pub fn into_entry(self) -> StorageResult<RunEntry> {
        serde_json::from_str(&self.entry).map_err(|e| {
            StorageError::Serialization(format!("run {}: {}", self.run_id, e))
        })
    }
}
