//! Error taxonomy for Shipline.
//!
//! Gate denial is deliberately absent: a deny is a terminal control outcome
//! recorded on the run (`RunStatus::Denied`), not an error.

use thiserror::Error;

/// Errors produced while building or validating a stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Adding the stage would close a dependency cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("stage already defined: {stage}")]
    DuplicateStage { stage: String },

    #[error("stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("stage not found in graph: {stage}")]
    StageNotFound { stage: String },
}

/// Errors produced while loading a pipeline definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pipeline file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid gate {gate}: {reason}")]
    InvalidGate { gate: String, reason: String },

    #[error("invalid stage {stage}: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

/// Shipline engine errors.
#[derive(Debug, Error)]
pub enum ShiplineError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("stage {stage} already reached terminal state {status}")]
    StageAlreadyTerminal { stage: String, status: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for Shipline operations.
pub type Result<T> = std::result::Result<T, ShiplineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_displays_path() {
        let err = GraphError::Cycle {
            path: vec!["test".to_string(), "build".to_string(), "test".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: test -> build -> test"
        );
    }

    #[test]
    fn test_unknown_dependency_names_both_stages() {
        let err = GraphError::UnknownDependency {
            stage: "deploy".to_string(),
            dependency: "package".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deploy"));
        assert!(msg.contains("package"));
    }

    #[test]
    fn test_graph_error_lifts_into_shipline_error() {
        let err: ShiplineError = GraphError::DuplicateStage {
            stage: "lint".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("graph error"));
    }
}
