//! Pipeline engine: gates, batched stage execution, notification, history.
//!
//! One call to [`PipelineEngine::run`] drives a run from `Pending` to a
//! terminal status:
//!
//! 1. Resolve the lookups the gates declare, evaluate the gates, and deny
//!    the run if any gate denies.
//! 2. Walk the readiness batches. Stages in a batch run concurrently, bounded
//!    by a semaphore; each batch is joined before the next one starts.
//! 3. A stage whose predecessor did not succeed is skipped without invoking
//!    its action. With `halt_on_failure`, every later stage is skipped once
//!    any stage failed.
//! 4. Notify exactly once and append to history. Neither can change the
//!    outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shipline_state::RunHistory;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;

use crate::config::{EngineSettings, PipelineDefinition};
use crate::domain::{
    CapturedOutput, ExecutionResult, FailureReason, Outcome, PipelineRun, Result, StageSpec,
    StageStatus, TriggerContext,
};
use crate::executor::{ActionInvoker, Executor};
use crate::gate::{GateReport, GateSet};
use crate::graph::StageGraph;
use crate::lookup::PullRequestLookup;
use crate::notifier::{notify_best_effort, LogNotifier, Notifier};
use crate::obs;

/// Runs one pipeline definition against triggers.
#[derive(Clone)]
pub struct PipelineEngine {
    name: String,
    definition_digest: String,
    graph: StageGraph,
    gates: GateSet,
    settings: EngineSettings,
    env: BTreeMap<String, String>,
    invoker: Arc<dyn ActionInvoker>,
    executor: Executor,
    lookup: Option<Arc<dyn PullRequestLookup>>,
    notifier: Arc<dyn Notifier>,
    history: Option<Arc<dyn RunHistory>>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("name", &self.name)
            .field("stages", &self.graph.len())
            .field("gates", &self.gates.gates.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Engine over an already built graph.
    ///
    /// Fails if the graph references a stage that was never added.
    pub fn new(
        name: impl Into<String>,
        graph: StageGraph,
        invoker: Arc<dyn ActionInvoker>,
    ) -> Result<Self> {
        graph.validate()?;
        let settings = EngineSettings::default();
        Ok(Self {
            name: name.into(),
            definition_digest: String::new(),
            graph,
            gates: GateSet::default(),
            executor: executor_for(&settings, Arc::clone(&invoker)),
            invoker,
            settings,
            env: BTreeMap::new(),
            lookup: None,
            notifier: Arc::new(LogNotifier),
            history: None,
        })
    }

    /// Engine for a validated pipeline definition.
    pub fn from_definition(
        definition: &PipelineDefinition,
        invoker: Arc<dyn ActionInvoker>,
    ) -> Result<Self> {
        definition.validate()?;
        let graph = definition.build_graph()?;
        Ok(Self::new(definition.name.clone(), graph, invoker)?
            .with_settings(definition.settings.clone())
            .with_gates(definition.gate_set())
            .with_env(definition.env.clone())
            .with_definition_digest(definition.digest()?))
    }

    /// Replace the settings; the executor is rebuilt to match.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.executor = executor_for(&settings, Arc::clone(&self.invoker));
        self.settings = settings;
        self
    }

    pub fn with_gates(mut self, gates: GateSet) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_definition_digest(mut self, digest: impl Into<String>) -> Self {
        self.definition_digest = digest.into();
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn PullRequestLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Stage ids per readiness batch.
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        Ok(self
            .graph
            .batches()?
            .map(|batch| batch.into_iter().map(|s| s.id.clone()).collect())
            .collect())
    }

    /// Evaluate the gates for `trigger` without running anything.
    pub async fn check_gates(&self, trigger: &TriggerContext) -> GateReport {
        let ctx = self
            .gates
            .prepare_context(trigger, self.lookup.as_deref())
            .await;
        self.gates.evaluate(&ctx)
    }

    /// Drive one run for `trigger` to a terminal status.
    pub async fn run(&self, trigger: TriggerContext) -> Result<PipelineRun> {
        let run = PipelineRun::new(
            self.name.clone(),
            self.definition_digest.clone(),
            trigger,
            self.graph.stages().cloned(),
        );
        let span = obs::run_span(run.id.as_str(), &self.name);
        self.drive(run).instrument(span).await
    }

    async fn drive(&self, mut run: PipelineRun) -> Result<PipelineRun> {
        let run_id = run.id.to_string();

        if !self.gates.is_empty() {
            let report = self.check_gates(&run.trigger).await;
            for outcome in &report.outcomes {
                obs::emit_gate_evaluated(
                    &run_id,
                    &outcome.gate,
                    outcome.decision.is_allow(),
                    outcome.decision.reason(),
                );
            }
            run.gates = report.outcomes.clone();

            if let Some(reason) = report.denial_reason() {
                run.deny(reason.clone())?;
                obs::emit_run_denied(&run_id, &reason);
                self.finalize(&run).await;
                return Ok(run);
            }
        }

        run.start()?;
        obs::emit_run_started(
            &run_id,
            &self.name,
            run.trigger.event.as_str(),
            &run.trigger.target_branch,
            run.stages.len(),
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut halted_by: Option<String> = None;

        for batch in self.graph.batches()? {
            let mut runnable: Vec<StageSpec> = Vec::new();
            for spec in batch {
                if let Some(reason) = self.skip_reason(&run, spec, halted_by.as_deref()) {
                    obs::emit_stage_skipped(&run_id, &spec.id, &reason);
                    if let Some(record) = run.stage_mut(&spec.id) {
                        record.skip(reason)?;
                    }
                } else {
                    runnable.push(spec.clone());
                }
            }

            // Stages report in once they hold a permit; only then are they Running.
            let (started_tx, mut started_rx) = mpsc::unbounded_channel::<String>();
            let mut tasks = Vec::with_capacity(runnable.len());
            for spec in runnable {
                let env = self.stage_env(&run_id, &run.trigger, &spec);
                let executor = self.executor.clone();
                let sem = Arc::clone(&semaphore);
                let started = started_tx.clone();
                let stage_id = spec.id.clone();
                let task = tokio::spawn(
                    async move {
                        let _permit = sem.acquire_owned().await.ok();
                        let _ = started.send(spec.id.clone());
                        executor.run(&spec, env).await
                    }
                    .in_current_span(),
                );
                tasks.push((stage_id, task));
            }
            drop(started_tx);

            let mut batch_done = Box::pin(join_all(
                tasks
                    .into_iter()
                    .map(|(stage_id, task)| async move { (stage_id, task.await) }),
            ));
            let joined = loop {
                tokio::select! {
                    Some(stage_id) = started_rx.recv() => {
                        self.mark_started(&mut run, &run_id, &stage_id)?;
                    }
                    joined = &mut batch_done => break joined,
                }
            };
            while let Ok(stage_id) = started_rx.try_recv() {
                self.mark_started(&mut run, &run_id, &stage_id)?;
            }

            for (stage_id, joined) in joined {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => ExecutionResult {
                        stage_id: stage_id.clone(),
                        outcome: Outcome::Failure(FailureReason::ActionError {
                            detail: format!("executor task aborted: {e}"),
                        }),
                        exit_code: None,
                        output: CapturedOutput::default(),
                        duration_ms: 0,
                    },
                };
                obs::emit_stage_finished(
                    &run_id,
                    &stage_id,
                    result.succeeded(),
                    result.duration_ms,
                    result.output.reference(),
                );
                if !result.succeeded() && halted_by.is_none() && self.settings.halt_on_failure {
                    halted_by = Some(stage_id.clone());
                }
                if let Some(record) = run.stage_mut(&stage_id) {
                    record.complete(result)?;
                }
            }
        }

        let status = run.finish()?;
        obs::emit_run_finished(
            &run_id,
            status.as_str(),
            run.duration_ms(),
            run.executed_count(),
        );
        self.finalize(&run).await;
        Ok(run)
    }

    fn mark_started(&self, run: &mut PipelineRun, run_id: &str, stage_id: &str) -> Result<()> {
        if let Some(record) = run.stage_mut(stage_id) {
            record.mark_running()?;
        }
        obs::emit_stage_started(run_id, stage_id);
        Ok(())
    }

    /// Why `spec` must not run, if it must not.
    fn skip_reason(
        &self,
        run: &PipelineRun,
        spec: &StageSpec,
        halted_by: Option<&str>,
    ) -> Option<String> {
        if let Some(failed) = halted_by {
            return Some(format!("run halted after {failed} failed"));
        }
        spec.depends_on.iter().find_map(|dep| {
            let status = run.stage(dep).map(|s| s.status)?;
            match status {
                StageStatus::Succeeded => None,
                StageStatus::Failed => Some(format!("dependency {dep} failed")),
                other => Some(format!("dependency {dep} {other}")),
            }
        })
    }

    /// Pipeline env, then trigger variables, then stage env; later wins.
    fn stage_env(
        &self,
        run_id: &str,
        trigger: &TriggerContext,
        spec: &StageSpec,
    ) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(trigger.env_vars(run_id));
        env.insert("SHIPLINE_STAGE".to_string(), spec.id.clone());
        env.extend(spec.env.clone());
        env
    }

    async fn finalize(&self, run: &PipelineRun) {
        notify_best_effort(self.notifier.as_ref(), run).await;

        let Some(history) = &self.history else {
            return;
        };
        let appended = match run.to_history_entry() {
            Ok(entry) => history.append(entry).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = appended {
            obs::emit_history_failed(run.id.as_str(), &e);
        }
    }
}

fn executor_for(settings: &EngineSettings, invoker: Arc<dyn ActionInvoker>) -> Executor {
    let executor = Executor::new(invoker)
        .with_default_timeout(Duration::from_secs(settings.default_timeout_secs))
        .with_max_output_bytes(settings.max_output_bytes);
    match &settings.working_dir {
        Some(dir) => executor.with_working_dir(dir.clone()),
        None => executor,
    }
}
