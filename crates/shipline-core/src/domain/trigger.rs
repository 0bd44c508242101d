//! Trigger context: what fired the run and where it came from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of event that fired a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Manual,
    Push,
    PullRequest,
    MergeQueue,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Manual => "manual",
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::MergeQueue => "merge_queue",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            "push" => Ok(EventKind::Push),
            "pull_request" | "pr" => Ok(EventKind::PullRequest),
            "merge_queue" | "merge_group" => Ok(EventKind::MergeQueue),
            other => Err(format!(
                "unknown event kind '{other}' (expected manual, push, pull_request, merge_queue)"
            )),
        }
    }
}

/// Everything the engine knows about the request that fired a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub event: EventKind,
    /// Branch the change targets (push branch, PR base, queue base).
    pub target_branch: String,
    /// Source reference: head branch or commit SHA.
    pub source_ref: String,
    /// Identity of whoever fired the trigger.
    pub actor: String,
    /// Event sub-action, e.g. `opened` for pull requests or `enqueued` for
    /// the merge queue.
    #[serde(default)]
    pub action: Option<String>,
    /// Originating pull request, when there is one to report back to.
    #[serde(default)]
    pub pull_request: Option<u64>,
}

impl TriggerContext {
    pub fn new(
        event: EventKind,
        target_branch: impl Into<String>,
        source_ref: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event,
            target_branch: target_branch.into(),
            source_ref: source_ref.into(),
            actor: actor.into(),
            action: None,
            pull_request: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_pull_request(mut self, number: u64) -> Self {
        self.pull_request = Some(number);
        self
    }

    /// Variables exported to every stage of the run.
    pub fn env_vars(&self, run_id: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SHIPLINE_RUN_ID".to_string(), run_id.to_string());
        env.insert("SHIPLINE_EVENT".to_string(), self.event.to_string());
        env.insert("SHIPLINE_BRANCH".to_string(), self.target_branch.clone());
        env.insert("SHIPLINE_SOURCE_REF".to_string(), self.source_ref.clone());
        env.insert("SHIPLINE_ACTOR".to_string(), self.actor.clone());
        if let Some(action) = &self.action {
            env.insert("SHIPLINE_ACTION".to_string(), action.clone());
        }
        if let Some(pr) = self.pull_request {
            env.insert("SHIPLINE_PULL_REQUEST".to_string(), pr.to_string());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse_aliases() {
        assert_eq!("merge_group".parse::<EventKind>().unwrap(), EventKind::MergeQueue);
        assert_eq!("pull-request".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert_eq!("PUSH".parse::<EventKind>().unwrap(), EventKind::Push);
        assert!("tag".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_kind_round_trips_display() {
        for kind in [
            EventKind::Manual,
            EventKind::Push,
            EventKind::PullRequest,
            EventKind::MergeQueue,
        ] {
            assert_eq!(kind.to_string().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_env_vars_include_optional_fields_only_when_set() {
        let bare = TriggerContext::new(EventKind::Push, "main", "abc123", "alice");
        let env = bare.env_vars("run-1");
        assert_eq!(env["SHIPLINE_EVENT"], "push");
        assert!(!env.contains_key("SHIPLINE_ACTION"));

        let queued = bare.with_action("enqueued").with_pull_request(7);
        let env = queued.env_vars("run-1");
        assert_eq!(env["SHIPLINE_ACTION"], "enqueued");
        assert_eq!(env["SHIPLINE_PULL_REQUEST"], "7");
    }
}
