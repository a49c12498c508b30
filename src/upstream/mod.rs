//! Upstream APIs the gateway forwards to.
//!
//! # Data Flow
//! ```text
//! matched route
//!     → client.rs (resolve upstream, build URL, inject API key)
//!     → reqwest (HTTP/HTTPS to managed database or third-party API)
//!     → http::response (shape reply, map database errors)
//! ```
//!
//! # Design Decisions
//! - One pooled HTTP client per configuration snapshot
//! - Timeouts are distinct from connection failures (504 vs 502)

pub mod client;

use axum::http::StatusCode;
use thiserror::Error;

pub use client::{Upstream, UpstreamClient};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream '{0}' is not configured")]
    Unknown(String),

    #[error("Invalid upstream configuration: {0}")]
    InvalidConfig(String),

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Upstream request failed: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Unknown(_) | UpstreamError::InvalidConfig(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::Unknown(_) => "unknown_upstream",
            UpstreamError::InvalidConfig(_) => "invalid_upstream",
            UpstreamError::Timeout => "upstream_timeout",
            UpstreamError::Transport(_) => "upstream_unavailable",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}
