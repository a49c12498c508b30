//! Uniform JSON error responses.
//!
//! Every failure leaving the gateway has the body
//! `{"error": "<message>", "code": "<code or null>"}`. Error codes reported by
//! the managed database are translated into HTTP statuses here.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::request_registry::Rejection;
use crate::security::rate_limit::ceil_secs;
use crate::upstream::UpstreamError;

/// Error body emitted for every failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Error shape used by the database's REST layer.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseError {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// HTTP status for a known database error code.
pub fn status_for_db_code(code: &str) -> Option<StatusCode> {
    let status = match code {
        // unique_violation, foreign_key_violation
        "23505" | "23503" => StatusCode::CONFLICT,
        // not_null_violation, check_violation, invalid_text_representation
        "23502" | "23514" | "22P02" => StatusCode::BAD_REQUEST,
        // insufficient_privilege: row-level security denied the write
        "42501" => StatusCode::FORBIDDEN,
        // single-object request matched zero or many rows
        "PGRST116" => StatusCode::NOT_FOUND,
        // JWT expired or invalid
        "PGRST301" => StatusCode::UNAUTHORIZED,
        // undefined_table
        "42P01" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => return None,
    };
    Some(status)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No matching route found")]
    NoRoute,

    #[error("Too many requests")]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Registry(#[from] Rejection),

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{message}")]
    Database {
        status: StatusCode,
        code: String,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },
}

impl ApiError {
    /// Wrap a database error, using `fallback` when the code is unknown.
    pub fn from_database(err: DatabaseError, fallback: StatusCode) -> Self {
        let status = status_for_db_code(&err.code).unwrap_or(fallback);
        ApiError::Database {
            status,
            message: err
                .message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Error").to_string()),
            code: err.code,
            details: err.details,
            hint: err.hint,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NoRoute | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Registry(Rejection::InFlight) => StatusCode::CONFLICT,
            ApiError::Registry(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Upstream(e) => e.status(),
            ApiError::Database { status, .. } => *status,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::NoRoute => Some("no_route"),
            ApiError::RateLimited { .. } => Some("rate_limited"),
            ApiError::Registry(r) => Some(r.reason()),
            ApiError::PayloadTooLarge => Some("payload_too_large"),
            ApiError::Unauthorized => Some("unauthorized"),
            ApiError::NotFound => Some("not_found"),
            ApiError::Upstream(e) => Some(e.code()),
            ApiError::Database { code, .. } => Some(code),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            ApiError::Registry(r) => r.retry_after(),
            _ => None,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (details, hint) = match self {
            ApiError::Database { details, hint, .. } => (details.clone(), hint.clone()),
            _ => (None, None),
        };
        ErrorBody {
            error: self.to_string(),
            code: self.code().map(str::to_string),
            details,
            hint,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let mut response = (status, Json(self.body())).into_response();
        if let Some(retry_after) = self.retry_after() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(ceil_secs(retry_after).max(1)),
            );
        }
        response
    }
}
