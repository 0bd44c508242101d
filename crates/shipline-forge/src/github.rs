//! GitHub REST adapter.
//!
//! One client serves both seams the engine needs from GitHub: the open
//! pull-request lookup behind gates, and the pull-request comment that
//! reports a finished run.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use serde::{Deserialize, Serialize};
use shipline_core::{
    render_summary, LookupError, Notifier, NotifyError, PipelineRun, PullRequest,
    PullRequestLookup, PullRequestQuery, PullRequestState,
};
use tracing::{debug, info};

use crate::error::{clip, ForgeError};
use crate::http::{self, DEFAULT_TIMEOUT};
use crate::Result;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

/// Pages of 100 followed before a listing is reported as truncated.
pub const MAX_PAGES: usize = 10;

/// GitHub connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubConfig {
    /// REST API root, without trailing slash.
    pub api_url: String,
    /// `owner/name`
    pub repository: String,
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl GitHubConfig {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            repository: repository.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read `SHIPLINE_GITHUB_REPO` (falling back to `GITHUB_REPOSITORY`),
    /// `SHIPLINE_GITHUB_API`, `SHIPLINE_HTTP_TIMEOUT_SECS` and `GITHUB_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let repository = std::env::var("SHIPLINE_GITHUB_REPO")
            .or_else(|_| std::env::var("GITHUB_REPOSITORY"))
            .map_err(|_| ForgeError::Config("SHIPLINE_GITHUB_REPO is not set".to_string()))?;
        let mut config = Self::new(repository);
        if let Ok(api) = std::env::var("SHIPLINE_GITHUB_API") {
            config = config.with_api_url(api);
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            config = config.with_token(token);
        }
        if let Ok(secs) = std::env::var("SHIPLINE_HTTP_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                ForgeError::Config(format!("SHIPLINE_HTTP_TIMEOUT_SECS is not a number: '{secs}'"))
            })?;
            config = config.with_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.trim().is_empty() {
            None
        } else {
            Some(token)
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(ForgeError::Config("timeout must be non-zero".to_string()));
        }
        match self.repository.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(())
            }
            _ => Err(ForgeError::Config(format!(
                "repository must be owner/name, got '{}'",
                self.repository
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    name: String,
}

/// Subset of the pull request object returned by `GET /pulls`.
#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    state: String,
    head: ApiRef,
    base: ApiRef,
}

impl From<ApiPullRequest> for PullRequest {
    fn from(api: ApiPullRequest) -> Self {
        PullRequest {
            number: api.number,
            head: api.head.name,
            base: api.base.name,
            state: if api.state == "open" {
                PullRequestState::Open
            } else {
                PullRequestState::Closed
            },
            title: api.title,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    config: GitHubConfig,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ForgeError::Config(format!("invalid token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = http::client(config.timeout, headers)?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GitHubConfig::from_env()?)
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.config.api_url, self.config.repository, path
        )
    }

    fn pulls_request(&self, query: &PullRequestQuery) -> Result<reqwest::Request> {
        Ok(self
            .http
            .get(self.repo_url("pulls"))
            .query(&[
                ("state", query.state.as_str()),
                ("base", query.base.as_str()),
                ("per_page", "100"),
            ])
            .build()?)
    }

    fn next_page_request(&self, url: &str) -> Result<reqwest::Request> {
        Ok(self.http.get(url).build()?)
    }

    fn comment_request(&self, number: u64, body: &str) -> Result<reqwest::Request> {
        Ok(self
            .http
            .post(self.repo_url(&format!("issues/{number}/comments")))
            .json(&CommentBody { body })
            .build()?)
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let response = self.http.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ForgeError::Status {
                status: status.as_u16(),
                body: clip(&body),
            })
        }
    }

    /// Every pull request matching `query`, following `Link: rel="next"`
    /// for at most [`MAX_PAGES`] pages.
    pub async fn list_pull_requests(&self, query: &PullRequestQuery) -> Result<Vec<PullRequest>> {
        let mut request = self.pulls_request(query)?;
        let mut prs = Vec::new();
        for page in 1..=MAX_PAGES {
            debug!(url = %request.url(), page, "listing pull requests");
            let response = self.send(request).await?;
            let next = next_link(response.headers());
            let batch: Vec<ApiPullRequest> = response.json().await?;
            prs.extend(batch.into_iter().map(PullRequest::from));

            match next {
                Some(url) => request = self.next_page_request(&url)?,
                None => return Ok(prs),
            }
        }
        Err(ForgeError::Truncated { pages: MAX_PAGES })
    }

    /// Post `body` as a comment on pull request `number`.
    pub async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let request = self.comment_request(number, body)?;
        self.send(request).await?;
        info!(repository = %self.config.repository, pull_request = number, "posted run summary");
        Ok(())
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|entry| {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|param| param.trim() == r#"rel="next""#);
            let url = target.strip_prefix('<')?.strip_suffix('>')?;
            is_next.then(|| url.to_string())
        })
}

#[async_trait]
impl PullRequestLookup for GitHubClient {
    async fn pull_requests(
        &self,
        query: &PullRequestQuery,
    ) -> std::result::Result<Vec<PullRequest>, LookupError> {
        Ok(self.list_pull_requests(query).await?)
    }
}

/// Comments the run summary on the pull request that fired the run.
#[async_trait]
impl Notifier for GitHubClient {
    async fn notify(&self, run: &PipelineRun) -> std::result::Result<(), NotifyError> {
        let Some(number) = run.trigger.pull_request else {
            return Err(NotifyError::NoTarget(format!(
                "run {} was not triggered by a pull request",
                run.id
            )));
        };
        Ok(self.comment(number, &render_summary(run)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipline_core::{ActionRef, EventKind, StageSpec, TriggerContext};

    fn client() -> GitHubClient {
        GitHubClient::new(
            GitHubConfig::new("acme/web")
                .with_api_url("https://ghe.example.com/api/v3/")
                .with_token("t0ken"),
        )
        .unwrap()
    }

    #[test]
    fn test_repository_must_be_owner_slash_name() {
        for bad in ["acme", "/web", "acme/", "acme/web/extra"] {
            assert!(
                matches!(GitHubClient::new(GitHubConfig::new(bad)), Err(ForgeError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_timeout_defaults_and_rejects_zero() {
        assert_eq!(GitHubConfig::new("acme/web").timeout, DEFAULT_TIMEOUT);
        let zero = GitHubConfig::new("acme/web").with_timeout(Duration::ZERO);
        assert!(matches!(GitHubClient::new(zero), Err(ForgeError::Config(_))));
    }

    #[test]
    fn test_next_link_picks_rel_next() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.github.com/repositories/1/pulls?page=3>; rel=\"next\", \
                 <https://api.github.com/repositories/1/pulls?page=5>; rel=\"last\"",
            ),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://api.github.com/repositories/1/pulls?page=3")
        );
    }

    #[test]
    fn test_next_link_absent_on_last_page() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_link(&headers), None);
        headers.insert(
            LINK,
            HeaderValue::from_static("<https://api.github.com/x?page=1>; rel=\"prev\""),
        );
        assert_eq!(next_link(&headers), None);
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let config = GitHubConfig::new("acme/web").with_token("  ");
        assert!(config.token.is_none());
    }

    #[test]
    fn test_pulls_request_targets_base() {
        let request = client()
            .pulls_request(&PullRequestQuery::open_against("release/2.0"))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request.url().as_str(),
            "https://ghe.example.com/api/v3/repos/acme/web/pulls\
             ?state=open&base=release%2F2.0&per_page=100"
        );
    }

    #[test]
    fn test_comment_request_shape() {
        let request = client().comment_request(42, "all green").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert!(request.url().path().ends_with("/repos/acme/web/issues/42/comments"));
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["body"], "all green");
    }

    #[test]
    fn test_api_pull_request_conversion() {
        let api: Vec<ApiPullRequest> = serde_json::from_str(
            r#"[{"number":12,"title":"Release 1.4","state":"open",
                "head":{"ref":"release/1.4","sha":"abc"},
                "base":{"ref":"staging","sha":"def"},
                "user":{"login":"bob"}}]"#,
        )
        .unwrap();
        let prs: Vec<PullRequest> = api.into_iter().map(PullRequest::from).collect();
        assert_eq!(prs[0].number, 12);
        assert_eq!(prs[0].head, "release/1.4");
        assert_eq!(prs[0].base, "staging");
        assert_eq!(prs[0].state, PullRequestState::Open);
    }

    #[tokio::test]
    async fn test_notify_without_pull_request_has_no_target() {
        let run = PipelineRun::new(
            "deploy",
            "digest",
            TriggerContext::new(EventKind::Push, "main", "abc", "alice"),
            [StageSpec::new("lint", ActionRef::command(["true"]))],
        );
        let err = client().notify(&run).await.unwrap_err();
        assert!(matches!(err, NotifyError::NoTarget(_)));
    }
}
