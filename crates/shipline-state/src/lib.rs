//! Shipline-State: run history persistence
//!
//! Pipeline runs are archived once they reach a terminal status and their
//! notification has been attempted. The history is append-only and keyed by
//! run identifier.
//!
//! ## Key Components
//!
//! - `RunHistory`: backend-agnostic async trait
//! - `MemoryRunHistory`: in-memory fake for tests
//! - `SurrealRunHistory`: SurrealDB backend (`mem://`, `surrealkv://`, remote)

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_history;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    RunEntry, RunHistory, RunId, RunOutcome, StageSnapshot, StorageResult,
};
pub use surreal_history::SurrealRunHistory;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
