//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → MatchedRoute attached to request extensions, or 404
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Sort by priority
//!     → Compile matchers
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Deterministic: same input always matches same route
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

use std::ops::Deref;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::error::ApiError;
use crate::http::server::AppState;

pub use router::{Route, Router};

/// Route selected for a request, stored in request extensions.
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub Arc<Route>);

impl Deref for MatchedRoute {
    type Target = Route;

    fn deref(&self) -> &Route {
        &self.0
    }
}

/// Resolve the route for a request before any limiting happens.
pub async fn route_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let snapshot = state.snapshot();
    match snapshot.router.match_request(&request) {
        Some(route) => {
            let matched = MatchedRoute(route);
            request.extensions_mut().insert(matched.clone());
            let mut response = next.run(request).await;
            // Lets outer layers (metrics) label the response by route.
            response.extensions_mut().insert(matched);
            response
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "No route matched");
            ApiError::NoRoute.into_response()
        }
    }
}
