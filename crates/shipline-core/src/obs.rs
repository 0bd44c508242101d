//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span for the engine future
//! - Emission functions for run, gate and stage lifecycle events
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event` field
//! so log pipelines can filter on it.

use tracing::{info, warn};

/// Run-scoped span for async code, attached with `Instrument::instrument`.
pub fn run_span(run_id: &str, pipeline: &str) -> tracing::Span {
    tracing::info_span!("shipline.run", run_id = %run_id, pipeline = %pipeline)
}

pub fn emit_run_started(run_id: &str, pipeline: &str, event: &str, branch: &str, stages: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        pipeline = %pipeline,
        trigger = %event,
        branch = %branch,
        stages = stages,
    );
}

pub fn emit_gate_evaluated(run_id: &str, gate: &str, allowed: bool, reason: Option<&str>) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        gate = %gate,
        allowed = allowed,
        reason = reason.unwrap_or(""),
    );
}

pub fn emit_run_denied(run_id: &str, reason: &str) {
    warn!(event = "run.denied", run_id = %run_id, reason = %reason);
}

pub fn emit_stage_started(run_id: &str, stage: &str) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage);
}

/// Emit event: stage finished, with its outcome and output reference.
pub fn emit_stage_finished(
    run_id: &str,
    stage: &str,
    success: bool,
    duration_ms: u64,
    output_ref: &str,
) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        success = success,
        duration_ms = duration_ms,
        output_ref = %output_ref,
    );
}

pub fn emit_stage_skipped(run_id: &str, stage: &str, reason: &str) {
    info!(event = "stage.skipped", run_id = %run_id, stage = %stage, reason = %reason);
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64, executed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        executed = executed,
    );
}

pub fn emit_notify_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "notify.failed", run_id = %run_id, error = %error);
}

pub fn emit_history_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "history.failed", run_id = %run_id, error = %error);
}
