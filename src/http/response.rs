//! Response shaping.
//!
//! # Responsibilities
//! - Turn an upstream reply into a client response
//! - Strip hop-by-hop headers
//! - Rewrite database error bodies into the gateway's error shape
//!
//! # Design Decisions
//! - Successful bodies are streamed, never buffered
//! - Only JSON error bodies are buffered (they are small)

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use futures_util::TryStreamExt;

use crate::http::error::{ApiError, DatabaseError};
use crate::security::headers::strip_hop_by_hop;
use crate::upstream::UpstreamError;

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

/// Convert an upstream reply into the response sent to the client.
pub async fn shape_upstream_response(upstream: reqwest::Response) -> Result<Response, ApiError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    if status.as_u16() >= 400 && is_json(&headers) {
        let bytes = upstream.bytes().await.map_err(UpstreamError::from)?;
        if let Ok(db_error) = serde_json::from_slice::<DatabaseError>(&bytes) {
            return Err(ApiError::from_database(db_error, status));
        }
        return Ok(build(status, headers, Body::from(bytes)));
    }

    let stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    Ok(build(status, headers, Body::from_stream(stream)))
}

fn build(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
