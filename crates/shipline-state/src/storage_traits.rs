//! Storage trait definitions for Shipline
//!
//! `RunHistory` is the optional durable collaborator of the pipeline engine:
//! an append-only log of terminal runs keyed by run identifier.
//!
//! The trait is async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Terminal outcome of an archived run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Denied,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// Flattened view of one stage at archive time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage_id: String,
    /// `succeeded` | `failed` | `skipped` | `pending`
    pub status: String,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    /// Failure detail or skip reason
    pub detail: Option<String>,
}

/// An archived pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: RunId,
    /// Pipeline definition name
    pub pipeline: String,
    /// SHA-256 of the pipeline definition the run was built from
    pub definition_digest: String,
    /// Trigger event kind (`push`, `pull_request`, ...)
    pub event: String,
    pub target_branch: String,
    pub source_ref: String,
    pub actor: String,
    pub outcome: RunOutcome,
    pub denial_reason: Option<String>,
    pub stages: Vec<StageSnapshot>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunEntry {
    /// Wall-clock duration between creation and terminal status.
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.created_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Append-only run history.
///
/// Guarantees:
/// - A run id is written at most once (`StorageError::Duplicate` otherwise).
/// - `list` returns the most recently finished runs first.
#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Archive a terminal run.
    async fn append(&self, entry: RunEntry) -> StorageResult<()>;

    /// Fetch one archived run.
    async fn get(&self, run_id: &RunId) -> StorageResult<RunEntry>;

    /// Most recent runs first, at most `limit` entries.
    async fn list(&self, limit: usize) -> StorageResult<Vec<RunEntry>>;

    /// Most recent runs of one pipeline, at most `limit` entries.
    async fn list_for_pipeline(&self, pipeline: &str, limit: usize)
        -> StorageResult<Vec<RunEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&RunOutcome::Denied).unwrap();
        assert_eq!(json, "\"denied\"");
    }

    #[test]
    fn test_entry_duration_never_negative() {
        let now = Utc::now();
        let entry = RunEntry {
            run_id: RunId::new(),
            pipeline: "deploy".to_string(),
            definition_digest: "d".to_string(),
            event: "push".to_string(),
            target_branch: "main".to_string(),
            source_ref: "abc".to_string(),
            actor: "ci".to_string(),
            outcome: RunOutcome::Succeeded,
            denial_reason: None,
            stages: vec![],
            created_at: now,
            finished_at: now - chrono::Duration::seconds(5),
        };
        assert_eq!(entry.duration_ms(), 0);
    }
}
