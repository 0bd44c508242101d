//! Stage definitions and per-run stage records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, ShiplineError};
use super::result::ExecutionResult;

/// Opaque descriptor of the external action a stage runs.
///
/// The first element of `argv` is the executable. The core never interprets
/// the command; container builds, deploy syncs and API calls all look the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub argv: Vec<String>,
}

impl ActionRef {
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty() || self.argv[0].trim().is_empty()
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// Static definition of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    /// Predecessor stage ids, in declaration order.
    pub depends_on: Vec<String>,
    pub action: ActionRef,
    /// Stage-specific environment; overrides pipeline and trigger variables.
    pub env: BTreeMap<String, String>,
    /// Overrides the pipeline default timeout.
    pub timeout_secs: Option<u64>,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, action: ActionRef) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            action,
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Result slot of a stage inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage as owned by one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub spec: StageSpec,
    pub status: StageStatus,
    pub result: Option<ExecutionResult>,
    pub skip_reason: Option<String>,
    /// When the action got an execution slot.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(spec: StageSpec) -> Self {
        Self {
            spec,
            status: StageStatus::Pending,
            result: None,
            skip_reason: None,
            started_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the executor result. Terminal exactly once.
    pub fn complete(&mut self, result: ExecutionResult) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = if result.succeeded() {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        };
        self.result = Some(result);
        Ok(())
    }

    /// Mark the stage skipped without invoking its action. Terminal exactly once.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = StageStatus::Skipped;
        self.skip_reason = Some(reason.into());
        Ok(())
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ShiplineError::StageAlreadyTerminal {
                stage: self.spec.id.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }
}
