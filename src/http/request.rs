//! Request identity.
//!
//! # Responsibilities
//! - Decide which client a request belongs to (for rate limits and dedupe)
//! - Attach that identity to request extensions
//!
//! # Design Decisions
//! - An identity header is only honored when configured; it must be set by a
//!   trusted auth layer, never accepted blindly from browsers
//! - `X-Forwarded-For` is ignored unless explicitly trusted
//! - The peer socket address is the final fallback

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::config::RateLimitConfig;
use crate::http::server::AppState;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity of the calling client, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, config: &RateLimitConfig) -> Self {
        if let Some(name) = &config.identity_header {
            if let Some(user) = header_str(headers, name) {
                return ClientKey(format!("user:{}", user));
            }
        }

        if config.trust_forwarded_for {
            let first_hop = header_str(headers, X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = first_hop {
                return ClientKey(ip.to_string());
            }
        }

        match peer {
            Some(addr) => ClientKey(addr.ip().to_string()),
            None => ClientKey("unknown".to_string()),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Attach a [`ClientKey`] to every gateway request.
pub async fn client_key_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = ClientKey::resolve(
        request.headers(),
        peer,
        &state.snapshot().config.rate_limit,
    );
    request.extensions_mut().insert(key);
    next.run(request).await
}
