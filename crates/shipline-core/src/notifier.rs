//! Best-effort reporting of terminal runs.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{PipelineRun, RunStatus, StageStatus};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The run has nowhere to report to, e.g. no originating pull request.
    #[error("no notification target: {0}")]
    NoTarget(String),
}

/// Notification sink for terminal runs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run: &PipelineRun) -> Result<(), NotifyError>;
}

/// Call `notifier` and swallow any error after logging it.
pub async fn notify_best_effort(notifier: &dyn Notifier, run: &PipelineRun) {
    if let Err(e) = notifier.notify(run).await {
        crate::obs::emit_notify_failed(run.id.as_str(), &e);
    }
}

fn status_icon(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Succeeded => "✅",
        StageStatus::Failed => "❌",
        StageStatus::Skipped => "⏭️",
        StageStatus::Pending | StageStatus::Running => "⏳",
    }
}

/// One-line headline for the run.
pub fn headline(run: &PipelineRun) -> String {
    let verdict = match run.status() {
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Denied => "was denied",
        RunStatus::Running => "is running",
        RunStatus::Pending => "is pending",
    };
    format!(
        "Pipeline `{}` {} for {} on `{}`",
        run.pipeline, verdict, run.trigger.event, run.trigger.target_branch
    )
}

/// Markdown summary listing every stage with its status.
pub fn render_summary(run: &PipelineRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "### {}", headline(run));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Run `{}` · source `{}` · actor `{}` · {} ms",
        run.id,
        run.trigger.source_ref,
        run.trigger.actor,
        run.duration_ms()
    );

    if let Some(reason) = &run.denial_reason {
        let _ = writeln!(out);
        let _ = writeln!(out, "**Denied:** {reason}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "| stage | status | detail |");
    let _ = writeln!(out, "|---|---|---|");
    for stage in &run.stages {
        let detail = match (&stage.result, &stage.skip_reason) {
            (Some(result), _) => match result.failure() {
                Some(reason) => reason.to_string(),
                None => format!("{} ms", result.duration_ms),
            },
            (None, Some(reason)) => reason.clone(),
            (None, None) => String::new(),
        };
        let _ = writeln!(
            out,
            "| `{}` | {} {} | {} |",
            stage.id(),
            status_icon(stage.status),
            stage.status,
            detail.replace('|', "\\|")
        );
    }
    out
}

/// Writes the summary to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, run: &PipelineRun) -> Result<(), NotifyError> {
        info!(
            event = "run.summary",
            run_id = %run.id,
            status = %run.status(),
            summary = %render_summary(run),
        );
        Ok(())
    }
}

/// Fans out to several notifiers.
///
/// Every notifier is tried; the first error is reported after all ran.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, run: &PipelineRun) -> Result<(), NotifyError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(run).await {
                warn!(run_id = %run.id, error = %e, "notifier in composite failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
