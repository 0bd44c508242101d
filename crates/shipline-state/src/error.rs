//! Error types for shipline-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a history backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

/// Errors returned by [`crate::RunHistory`] operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this id was archived
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The history is append-only; a run id may be written once
    #[error("run already recorded: {run_id}")]
    Duplicate { run_id: String },

    /// Entry could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_error_displays_run_id() {
        let err = StorageError::Duplicate {
            run_id: "run-42".to_string(),
        };
        assert!(err.to_string().contains("run-42"));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorageError = bad.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
