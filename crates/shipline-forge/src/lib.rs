//! Shipline Forge: HTTP adapters for the pipeline engine
//!
//! - `GitHubClient`: open pull-request lookup for gates, and pull-request
//!   comments for run summaries
//! - `WebhookNotifier`: JSON run report posted to any endpoint

mod error;
pub mod github;
mod http;
pub mod webhook;

pub use error::ForgeError;
pub use github::{GitHubClient, GitHubConfig, DEFAULT_API_URL, MAX_PAGES};
pub use http::DEFAULT_TIMEOUT;
pub use webhook::{WebhookNotifier, WebhookPayload};

/// Result type for forge operations
pub type Result<T> = std::result::Result<T, ForgeError>;
