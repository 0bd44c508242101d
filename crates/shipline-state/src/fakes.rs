//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryRunHistory` satisfies the `RunHistory` contract without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory run history backed by a `HashMap<RunId, RunEntry>`.
#[derive(Debug, Default)]
pub struct MemoryRunHistory {
    entries: Mutex<HashMap<String, RunEntry>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived runs.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted(entries: impl Iterator<Item = RunEntry>, limit: usize) -> Vec<RunEntry> {
        let mut out: Vec<RunEntry> = entries.collect();
        out.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        out.truncate(limit);
        out
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn append(&self, entry: RunEntry) -> StorageResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if entries.contains_key(entry.run_id.as_str()) {
            return Err(StorageError::Duplicate {
                run_id: entry.run_id.0.clone(),
            });
        }
        entries.insert(entry.run_id.0.clone(), entry);
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> StorageResult<RunEntry> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        entries
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<RunEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self::sorted(entries.values().cloned(), limit))
    }

    async fn list_for_pipeline(
        &self,
        pipeline: &str,
        limit: usize,
    ) -> StorageResult<Vec<RunEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self::sorted(
            entries.values().filter(|e| e.pipeline == pipeline).cloned(),
            limit,
        ))
    }
}
