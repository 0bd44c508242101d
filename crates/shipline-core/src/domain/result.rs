//! Execution results recorded by the executor.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The action did not finish within the stage timeout.
    Timeout { after_secs: u64 },
    /// Non-zero exit, spawn failure or remote error.
    ActionError { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { after_secs } => {
                write!(f, "timed out after {after_secs}s")
            }
            FailureReason::ActionError { detail } => f.write_str(detail),
        }
    }
}

/// Outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

/// Captured action output, truncated to a byte ceiling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// SHA-256 over the untruncated stdout and stderr.
    pub digest: String,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn capture(stdout: &[u8], stderr: &[u8], max_bytes: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stdout);
        hasher.update(b"\0");
        hasher.update(stderr);
        let digest = hex::encode(hasher.finalize());

        let truncated = stdout.len() > max_bytes || stderr.len() > max_bytes;
        Self {
            stdout: tail_lossy(stdout, max_bytes),
            stderr: tail_lossy(stderr, max_bytes),
            digest,
            truncated,
        }
    }

    /// Short reference form of the digest.
    pub fn reference(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

/// Keep the last `max_bytes` bytes; failures print their cause at the end.
fn tail_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let start = bytes.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Immutable record of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stage_id: String,
    pub outcome: Outcome,
    /// Process exit code, when the action got far enough to produce one.
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure(reason) => Some(reason),
        }
    }
}
