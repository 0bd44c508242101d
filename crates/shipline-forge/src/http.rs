//! Shared reqwest client construction.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::Result;

/// Whole-request timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("shipline/", env!("CARGO_PKG_VERSION"));

/// Client with a request timeout and a connect timeout no longer than it.
pub(crate) fn client(timeout: Duration, headers: HeaderMap) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
        .build()?)
}
