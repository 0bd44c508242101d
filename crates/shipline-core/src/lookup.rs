//! External pull-request lookup boundary.
//!
//! Gates never call out themselves. The engine collects the queries gates
//! declare, resolves each one once through a [`PullRequestLookup`], and
//! injects the answers into the gate context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State filter for a pull-request query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
}

impl PullRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestState::Open => "open",
            PullRequestState::Closed => "closed",
        }
    }
}

/// Query for pull requests targeting one base branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullRequestQuery {
    pub base: String,
    pub state: PullRequestState,
}

impl PullRequestQuery {
    pub fn open_against(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            state: PullRequestState::Open,
        }
    }
}

/// Pull request as reported by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    /// Head (source) branch name.
    pub head: String,
    /// Base (target) branch name.
    pub base: String,
    pub state: PullRequestState,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup transport error: {0}")]
    Transport(String),

    #[error("lookup returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("lookup response could not be decoded: {0}")]
    Decode(String),

    #[error("lookup not configured: {0}")]
    NotConfigured(String),

    /// The source could not return every matching pull request.
    #[error("lookup result incomplete: {0}")]
    Incomplete(String),
}

/// Source of pull-request state.
#[async_trait]
pub trait PullRequestLookup: Send + Sync {
    async fn pull_requests(&self, query: &PullRequestQuery)
        -> Result<Vec<PullRequest>, LookupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_against_sets_state() {
        let q = PullRequestQuery::open_against("staging");
        assert_eq!(q.base, "staging");
        assert_eq!(q.state.as_str(), "open");
    }

    #[test]
    fn test_pull_request_title_defaults() {
        let pr: PullRequest = serde_json::from_str(
            r#"{"number":7,"head":"release/1.2","base":"main","state":"open"}"#,
        )
        .unwrap();
        assert_eq!(pr.number, 7);
        assert!(pr.title.is_empty());
    }
}
