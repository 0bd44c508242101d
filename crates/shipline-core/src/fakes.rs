//! In-memory fakes for the engine's trait seams (testing only).
//!
//! - `ScriptedInvoker`: per-stage scripted action outcomes, records calls
//! - `StaticPullRequestLookup`: canned pull requests per base branch
//! - `RecordingNotifier` / `FailingNotifier`: notification sinks

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{PipelineRun, RunStatus};
use crate::executor::{ActionInvoker, ActionOutput, ActionRequest, InvokeError};
use crate::lookup::{LookupError, PullRequest, PullRequestLookup, PullRequestQuery};
use crate::notifier::{render_summary, NotifyError, Notifier};

/// What a scripted stage does when invoked.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed,
    Exit(i32),
    /// Sleeps far beyond any test timeout.
    Hang,
    Error(String),
}

/// Action invoker that replays a script keyed by stage id.
///
/// Unscripted stages succeed. Every invocation is recorded in order.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    steps: HashMap<String, ScriptedStep>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ActionRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, stage: impl Into<String>, step: ScriptedStep) -> Self {
        self.steps.insert(stage.into(), step);
        self
    }

    /// Stages that exit non-zero.
    pub fn failing(stage: impl Into<String>) -> Self {
        Self::new().with_step(stage, ScriptedStep::Exit(1))
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ActionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stage ids in invocation order.
    pub fn invoked(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.stage_id).collect()
    }

    pub fn was_invoked(&self, stage: &str) -> bool {
        self.invoked().iter().any(|s| s == stage)
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionInvoker for ScriptedInvoker {
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput, InvokeError> {
        let step = self
            .steps
            .get(&request.stage_id)
            .cloned()
            .unwrap_or(ScriptedStep::Succeed);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if matches!(step, ScriptedStep::Hang) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            ScriptedStep::Succeed | ScriptedStep::Hang => Ok(ActionOutput::success()),
            ScriptedStep::Exit(code) => {
                Ok(ActionOutput::exit(code).with_stderr(format!("scripted exit {code}")))
            }
            ScriptedStep::Error(msg) => Err(InvokeError::Remote(msg)),
        }
    }
}

/// Pull-request lookup with canned answers per base branch.
#[derive(Debug, Default)]
pub struct StaticPullRequestLookup {
    by_base: BTreeMap<String, Vec<PullRequest>>,
    error: Option<String>,
    queries: Mutex<Vec<PullRequestQuery>>,
}

impl StaticPullRequestLookup {
    /// Lookup that finds nothing anywhere.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lookup that fails every query.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_pull_request(mut self, pr: PullRequest) -> Self {
        self.by_base.entry(pr.base.clone()).or_default().push(pr);
        self
    }

    /// Queries received, in order.
    pub fn queries(&self) -> Vec<PullRequestQuery> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PullRequestLookup for StaticPullRequestLookup {
    async fn pull_requests(
        &self,
        query: &PullRequestQuery,
    ) -> Result<Vec<PullRequest>, LookupError> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.clone());
        if let Some(msg) = &self.error {
            return Err(LookupError::Transport(msg.clone()));
        }
        Ok(self
            .by_base
            .get(&query.base)
            .map(|prs| {
                prs.iter()
                    .filter(|pr| pr.state == query.state)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A notification as seen by [`RecordingNotifier`].
#[derive(Debug, Clone)]
pub struct Delivered {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: String,
}

/// Notifier that keeps every rendered summary.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingNotifier {
    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.delivered().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, run: &PipelineRun) -> Result<(), NotifyError> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivered {
                run_id: run.id.to_string(),
                status: run.status(),
                summary: render_summary(run),
            });
        Ok(())
    }
}

/// Notifier whose sink is always down.
#[derive(Debug)]
pub struct FailingNotifier {
    message: String,
    attempts: AtomicUsize,
}

impl FailingNotifier {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _run: &PipelineRun) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Transport(self.message.clone()))
    }
}
