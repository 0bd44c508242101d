//! Domain model: triggers, stages, runs, execution results and errors.

pub mod error;
pub mod result;
pub mod run;
pub mod stage;
pub mod trigger;

pub use error::{ConfigError, GraphError, Result, ShiplineError};
pub use result::{CapturedOutput, ExecutionResult, FailureReason, Outcome};
pub use run::{GateOutcome, PipelineRun, RunStatus};
pub use stage::{ActionRef, StageRecord, StageSpec, StageStatus};
pub use trigger::{EventKind, TriggerContext};
