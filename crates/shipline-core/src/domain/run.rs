//! Pipeline run record and its state machine.
//!
//! ```text
//! Pending -> Running -> { Succeeded, Failed }
//! Pending -> Denied
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipline_state::{RunEntry, RunId, RunOutcome, StageSnapshot};

use super::error::{Result, ShiplineError};
use super::stage::{StageRecord, StageSpec, StageStatus};
use super::trigger::TriggerContext;
use crate::gate::GateDecision;

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A gate blocked the run before any stage started.
    Denied,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Denied
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Denied => "denied",
        }
    }

    fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Denied)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision of one gate, kept on the run for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: String,
    pub decision: GateDecision,
}

/// One end-to-end execution of the stage graph for a single trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub definition_digest: String,
    pub trigger: TriggerContext,
    pub stages: Vec<StageRecord>,
    pub gates: Vec<GateOutcome>,
    pub denial_reason: Option<String>,
    status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(
        pipeline: impl Into<String>,
        definition_digest: impl Into<String>,
        trigger: TriggerContext,
        stages: impl IntoIterator<Item = StageSpec>,
    ) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            definition_digest: definition_digest.into(),
            trigger,
            stages: stages.into_iter().map(StageRecord::new).collect(),
            gates: Vec::new(),
            denial_reason: None,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.id() == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.id() == id)
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Pending -> Denied. No stage has run, so all remain pending.
    pub fn deny(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Denied)?;
        self.denial_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded | Failed, derived from the stage statuses.
    pub fn finish(&mut self) -> Result<RunStatus> {
        let next = self.derived_status();
        self.transition(next)?;
        self.finished_at = Some(Utc::now());
        Ok(next)
    }

    /// Status implied by the stage result slots.
    ///
    /// Any failed stage fails the run; a run whose every stage succeeded
    /// succeeded. Anything else is still running.
    pub fn derived_status(&self) -> RunStatus {
        if self.stages.iter().any(|s| s.status == StageStatus::Failed) {
            RunStatus::Failed
        } else if self
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Succeeded)
        {
            RunStatus::Succeeded
        } else if self.stages.iter().all(|s| s.status.is_terminal()) {
            // Skipped without a failure only happens when the run halted.
            RunStatus::Failed
        } else {
            RunStatus::Running
        }
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Stages whose action was actually invoked.
    pub fn executed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.result.is_some()).count()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }

    /// Flatten into an archive entry. Only terminal runs can be archived.
    pub fn to_history_entry(&self) -> Result<RunEntry> {
        let outcome = match self.status {
            RunStatus::Succeeded => RunOutcome::Succeeded,
            RunStatus::Failed => RunOutcome::Failed,
            RunStatus::Denied => RunOutcome::Denied,
            other => {
                return Err(ShiplineError::InvalidTransition {
                    from: other.to_string(),
                    to: "archived".to_string(),
                })
            }
        };

        let stages = self
            .stages
            .iter()
            .map(|s| StageSnapshot {
                stage_id: s.id().to_string(),
                status: s.status.to_string(),
                exit_code: s.result.as_ref().and_then(|r| r.exit_code),
                duration_ms: s.result.as_ref().map(|r| r.duration_ms),
                detail: s
                    .result
                    .as_ref()
                    .and_then(|r| r.failure())
                    .map(|f| f.to_string())
                    .or_else(|| s.skip_reason.clone()),
            })
            .collect();

        Ok(RunEntry {
            run_id: self.id.clone(),
            pipeline: self.pipeline.clone(),
            definition_digest: self.definition_digest.clone(),
            event: self.trigger.event.to_string(),
            target_branch: self.trigger.target_branch.clone(),
            source_ref: self.trigger.source_ref.clone(),
            actor: self.trigger.actor.clone(),
            outcome,
            denial_reason: self.denial_reason.clone(),
            stages,
            created_at: self.created_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        })
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ShiplineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}
