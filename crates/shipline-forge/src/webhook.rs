//! Generic JSON webhook notifier.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use shipline_core::{render_summary, Notifier, NotifyError, PipelineRun};
use tracing::info;

use crate::error::{clip, ForgeError};
use crate::http::{self, DEFAULT_TIMEOUT};
use crate::Result;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StagePayload {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Body posted to the webhook for every terminal run.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookPayload {
    pub pipeline: String,
    pub run_id: String,
    pub status: String,
    pub event: String,
    pub target_branch: String,
    pub source_ref: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    pub duration_ms: u64,
    pub stages: Vec<StagePayload>,
    /// Markdown summary, identical to the pull-request comment.
    pub summary: String,
}

impl WebhookPayload {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            pipeline: run.pipeline.clone(),
            run_id: run.id.to_string(),
            status: run.status().to_string(),
            event: run.trigger.event.to_string(),
            target_branch: run.trigger.target_branch.clone(),
            source_ref: run.trigger.source_ref.clone(),
            actor: run.trigger.actor.clone(),
            pull_request: run.trigger.pull_request,
            denial_reason: run.denial_reason.clone(),
            duration_ms: run.duration_ms(),
            stages: run
                .stages
                .iter()
                .map(|s| StagePayload {
                    id: s.id().to_string(),
                    status: s.status.to_string(),
                    detail: s
                        .result
                        .as_ref()
                        .and_then(|r| r.failure())
                        .map(|f| f.to_string())
                        .or_else(|| s.skip_reason.clone()),
                })
                .collect(),
            summary: render_summary(run),
        }
    }
}

/// Posts a [`WebhookPayload`] to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Notifier whose POST gives up after `timeout`.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ForgeError::Config(format!(
                "webhook url must be http(s), got '{url}'"
            )));
        }
        if timeout.is_zero() {
            return Err(ForgeError::Config("timeout must be non-zero".to_string()));
        }
        let http = http::client(timeout, HeaderMap::new())?;
        Ok(Self { url, timeout, http })
    }

    /// Read `SHIPLINE_WEBHOOK_URL`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SHIPLINE_WEBHOOK_URL")
            .map_err(|_| ForgeError::Config("SHIPLINE_WEBHOOK_URL is not set".to_string()))?;
        Self::new(url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        let response = self.http.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForgeError::Status {
                status: status.as_u16(),
                body: clip(&body),
            });
        }
        info!(run_id = %payload.run_id, status = %payload.status, "webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, run: &PipelineRun) -> std::result::Result<(), NotifyError> {
        Ok(self.post(&WebhookPayload::from_run(run)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipline_core::{ActionRef, EventKind, StageSpec, TriggerContext};

    fn denied_run() -> PipelineRun {
        let mut run = PipelineRun::new(
            "deploy",
            "digest",
            TriggerContext::new(EventKind::MergeQueue, "main", "abc", "bot")
                .with_action("enqueued")
                .with_pull_request(9),
            ["lint", "deploy"]
                .into_iter()
                .map(|id| StageSpec::new(id, ActionRef::command(["true"]))),
        );
        run.deny("no-open-release-pr: open pull request #7 (release/2.0) targets main")
            .unwrap();
        run
    }

    #[test]
    fn test_payload_carries_run_fields() {
        let payload = WebhookPayload::from_run(&denied_run());
        assert_eq!(payload.status, "denied");
        assert_eq!(payload.event, "merge_queue");
        assert_eq!(payload.pull_request, Some(9));
        assert_eq!(payload.stages.len(), 2);
        assert_eq!(payload.stages[0].status, "pending");
        assert!(payload.summary.contains("`deploy`"));
    }

    #[test]
    fn test_payload_omits_empty_optionals() {
        let mut run = PipelineRun::new(
            "deploy",
            "digest",
            TriggerContext::new(EventKind::Push, "main", "abc", "alice"),
            [StageSpec::new("lint", ActionRef::command(["true"]))],
        );
        run.start().unwrap();
        let json = serde_json::to_value(WebhookPayload::from_run(&run)).unwrap();
        assert!(json.get("denial_reason").is_none());
        assert!(json.get("pull_request").is_none());
        assert!(json["stages"][0].get("detail").is_none());
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            WebhookNotifier::new("ftp://hooks.example.com"),
            Err(ForgeError::Config(_))
        ));
        assert!(WebhookNotifier::new("https://hooks.example.com/shipline").is_ok());
    }

    #[test]
    fn test_timeout_defaults_and_rejects_zero() {
        let notifier = WebhookNotifier::new("https://hooks.example.com/shipline").unwrap();
        assert_eq!(notifier.timeout(), DEFAULT_TIMEOUT);
        assert!(matches!(
            WebhookNotifier::with_timeout("https://hooks.example.com", Duration::ZERO),
            Err(ForgeError::Config(_))
        ));
    }
}
