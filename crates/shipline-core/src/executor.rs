//! Stage execution.
//!
//! The [`Executor`] turns a [`StageSpec`] into an [`ExecutionResult`]. The
//! action itself goes through an [`ActionInvoker`]; [`ProcessInvoker`] runs it
//! as a local process. Timeouts are enforced here, outside the invoker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{CapturedOutput, ExecutionResult, FailureReason, Outcome, StageSpec};

/// Default ceiling for captured stdout/stderr, per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// What the invoker is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub stage_id: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Raw result of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ActionOutput {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error while waiting for action: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by a remote action backend.
    #[error("remote action failed: {0}")]
    Remote(String),
}

/// Action invocation boundary.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput, InvokeError>;
}

/// Runs actions as local child processes.
///
/// The child inherits the parent environment with the request's bundle
/// layered on top. Dropping the invocation future kills the child.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl ActionInvoker for ProcessInvoker {
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput, InvokeError> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(InvokeError::EmptyCommand {
                stage: request.stage_id,
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| InvokeError::Spawn {
            program: program.clone(),
            source,
        })?;
        let output = child.wait_with_output().await?;

        Ok(ActionOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Runs one stage with its timeout and records the result.
#[derive(Clone)]
pub struct Executor {
    invoker: Arc<dyn ActionInvoker>,
    /// Applied when the stage has no timeout of its own; zero disables it.
    default_timeout: Duration,
    max_output_bytes: usize,
    working_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("default_timeout", &self.default_timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(invoker: Arc<dyn ActionInvoker>) -> Self {
        Self {
            invoker,
            default_timeout: Duration::from_secs(600),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            working_dir: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn timeout_for(&self, stage: &StageSpec) -> Duration {
        stage
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Run `stage` with the fully composed environment `env`.
    ///
    /// Never returns an error: spawn failures, non-zero exits and timeouts
    /// all become a failed [`ExecutionResult`].
    pub async fn run(&self, stage: &StageSpec, env: BTreeMap<String, String>) -> ExecutionResult {
        let start = Instant::now();
        let timeout = self.timeout_for(stage);

        let request = ActionRequest {
            stage_id: stage.id.clone(),
            argv: stage.action.argv.clone(),
            env,
            working_dir: self.working_dir.clone(),
        };

        debug!(
            stage = %stage.id,
            action = %stage.action,
            timeout_secs = timeout.as_secs(),
            "invoking action"
        );
        let invocation = self.invoker.invoke(request);
        let outcome = if timeout.is_zero() {
            Ok(invocation.await)
        } else {
            tokio::time::timeout(timeout, invocation).await
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (outcome, exit_code, output) = match outcome {
            Err(_elapsed) => (
                Outcome::Failure(FailureReason::Timeout {
                    after_secs: timeout.as_secs(),
                }),
                None,
                CapturedOutput::default(),
            ),
            Ok(Err(e)) => (
                Outcome::Failure(FailureReason::ActionError {
                    detail: e.to_string(),
                }),
                None,
                CapturedOutput::default(),
            ),
            Ok(Ok(raw)) => {
                let output =
                    CapturedOutput::capture(&raw.stdout, &raw.stderr, self.max_output_bytes);
                let outcome = match raw.exit_code {
                    Some(0) => Outcome::Success,
                    code => Outcome::Failure(FailureReason::ActionError {
                        detail: exit_detail(code, &output.stderr),
                    }),
                };
                (outcome, raw.exit_code, output)
            }
        };

        ExecutionResult {
            stage_id: stage.id.clone(),
            outcome,
            exit_code,
            output,
            duration_ms,
        }
    }
}

fn exit_detail(code: Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(c) => format!("exited with code {c}"),
        None => "terminated by signal".to_string(),
    };
    match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("{status}: {}", last.trim()),
        None => status,
    }
}
