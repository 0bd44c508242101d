//! Error types for shipline-forge

use shipline_core::{LookupError, NotifyError};
use thiserror::Error;

/// Errors talking to the forge API or a webhook endpoint.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Client or connection setup is incomplete.
    #[error("forge not configured: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    /// The endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    /// A paginated listing had more pages than the client will follow.
    #[error("listing truncated after {pages} pages")]
    Truncated { pages: usize },
}

impl From<reqwest::Error> for ForgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ForgeError::Decode(err.to_string())
        } else if err.is_timeout() {
            ForgeError::Http(format!("request timed out: {err}"))
        } else {
            ForgeError::Http(err.to_string())
        }
    }
}

impl From<ForgeError> for LookupError {
    fn from(err: ForgeError) -> Self {
        match err {
            ForgeError::Config(msg) => LookupError::NotConfigured(msg),
            ForgeError::Http(msg) => LookupError::Transport(msg),
            ForgeError::Status { status, body } => LookupError::Status { status, body },
            ForgeError::Decode(msg) => LookupError::Decode(msg),
            truncated @ ForgeError::Truncated { .. } => {
                LookupError::Incomplete(truncated.to_string())
            }
        }
    }
}

impl From<ForgeError> for NotifyError {
    fn from(err: ForgeError) -> Self {
        match err {
            ForgeError::Status { status, body } => NotifyError::Rejected { status, body },
            other => NotifyError::Transport(other.to_string()),
        }
    }
}

/// Keep error bodies short enough for a log line.
pub(crate) fn clip(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
