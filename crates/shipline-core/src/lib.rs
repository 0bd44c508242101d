//! Shipline Core - deployment pipeline orchestration
//!
//! Provides a pipeline engine that:
//! - Orders stages by dependency into readiness batches
//! - Gates run start on trigger context and open pull-request state
//! - Executes each batch concurrently with per-stage timeouts
//! - Reports the terminal run back to its origin and archives it

pub mod config;
pub mod domain;
pub mod engine;
pub mod executor;
pub mod fakes;
pub mod gate;
pub mod graph;
pub mod lookup;
pub mod notifier;
pub mod obs;
pub mod telemetry;

pub use config::{CommandDef, EngineSettings, PipelineDefinition, StageDef};
pub use domain::{
    ActionRef, CapturedOutput, ConfigError, EventKind, ExecutionResult, FailureReason,
    GateOutcome, GraphError, Outcome, PipelineRun, Result, RunStatus, ShiplineError, StageRecord,
    StageSpec, StageStatus, TriggerContext,
};
pub use engine::PipelineEngine;
pub use executor::{
    ActionInvoker, ActionOutput, ActionRequest, Executor, InvokeError, ProcessInvoker,
};
pub use gate::{evaluate_gate, Gate, GateContext, GateDecision, GateReport, GateRule, GateSet};
pub use graph::{Batches, StageGraph};
pub use lookup::{LookupError, PullRequest, PullRequestLookup, PullRequestQuery, PullRequestState};
pub use notifier::{render_summary, CompositeNotifier, LogNotifier, Notifier, NotifyError};
pub use telemetry::init_tracing;
