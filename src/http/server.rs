//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with health, admin and gateway handlers
//! - Wire up middleware (tracing, request ID, timeout)
//! - Order the gateway chain: metrics → identity → route → rate limit → registry → forward
//! - Run background sweepers and apply hot-reloaded configuration
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin::setup_admin_router;
use crate::config::GatewayConfig;
use crate::http::error::ApiError;
use crate::http::request::client_key_middleware;
use crate::http::response::shape_upstream_response;
use crate::observability::metrics;
use crate::resilience::request_registry::{
    request_registry_middleware, RegistryPolicy, RequestRegistry,
};
use crate::routing::{route_middleware, MatchedRoute, Router as RouteTable};
use crate::security::headers::strip_request_headers;
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::upstream::{UpstreamClient, UpstreamError};

/// Extra time the outer request timeout allows beyond the upstream deadline.
/// The upstream client must time out first so the caller gets a JSON 504 and
/// the registry records the failure.
const OUTER_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Deadline for the whole request, always later than the upstream deadline.
fn outer_timeout(request_secs: u64) -> Duration {
    Duration::from_secs(request_secs).saturating_add(OUTER_TIMEOUT_GRACE)
}

/// Everything derived from one configuration file.
#[derive(Debug)]
pub struct Snapshot {
    pub config: GatewayConfig,
    pub router: RouteTable,
    pub upstreams: UpstreamClient,
}

impl Snapshot {
    pub fn build(config: GatewayConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            router: RouteTable::from_config(&config.routes),
            upstreams: UpstreamClient::from_config(&config)?,
            config,
        })
    }
}

/// Application state injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    snapshot: Arc<ArcSwap<Snapshot>>,
    pub limiter: Arc<RateLimiter>,
    pub registry: RequestRegistry,
    pub request_count: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, UpstreamError> {
        let registry = RequestRegistry::new(RegistryPolicy::from(&config.registry));
        Ok(Self {
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::build(config)?)),
            limiter: Arc::new(RateLimiter::new()),
            registry,
            request_count: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        })
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Swap in a new configuration. Rate limit counters and registry state survive.
    pub fn apply_config(&self, config: GatewayConfig) -> Result<(), UpstreamError> {
        let policy = RegistryPolicy::from(&config.registry);
        let snapshot = Snapshot::build(config)?;
        tracing::info!(
            routes = snapshot.router.routes().len(),
            upstreams = snapshot.upstreams.len(),
            "Applying new configuration"
        );
        self.snapshot.store(Arc::new(snapshot));
        self.registry.set_policy(policy);
        Ok(())
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, UpstreamError> {
        let state = AppState::new(config)?;
        let router = Self::build_router(&state);
        Ok(Self { router, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Router with all middleware layers, usable without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    #[allow(deprecated)]
    fn build_router(state: &AppState) -> Router {
        let snapshot = state.snapshot();
        let config = &snapshot.config;

        // Layers run outermost-last: the final `.layer` sees the request first.
        let gateway = Router::new()
            .fallback(gateway_handler)
            .layer(middleware::from_fn_with_state(state.clone(), request_registry_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), route_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), client_key_middleware))
            .layer(middleware::from_fn(metrics::track_requests))
            .with_state(state.clone());

        let mut app = Router::new().route("/health", get(health));
        if config.admin.enabled {
            app = app.merge(setup_admin_router(state.clone()));
        }

        app.fallback_service(gateway)
            .layer(TimeoutLayer::new(outer_timeout(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let snapshot = self.state.snapshot();
        tracing::info!(
            address = %addr,
            routes = snapshot.router.routes().len(),
            "HTTP server starting"
        );

        tokio::spawn(self.state.limiter.clone().run_sweeper(
            Duration::from_secs(snapshot.config.rate_limit.sweep_interval_secs),
            shutdown.resubscribe(),
        ));
        tokio::spawn(self.state.registry.clone().run_sweeper(
            Duration::from_secs(snapshot.config.registry.sweep_interval_secs),
            shutdown.resubscribe(),
        ));

        let state = self.state.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(config) = config_updates.recv() => {
                        if let Err(e) = state.apply_config(config) {
                            tracing::error!(error = %e, "Rejected configuration update");
                        }
                    }
                    _ = reload_shutdown.recv() => break,
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Forward a routed request to its upstream.
async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(state: &AppState, request: Request<Body>) -> Result<Response, ApiError> {
    let route = request
        .extensions()
        .get::<MatchedRoute>()
        .cloned()
        .ok_or(ApiError::NoRoute)?;
    let snapshot = state.snapshot();
    let upstream = snapshot.upstreams.get(&route.upstream)?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, snapshot.config.security.max_body_size)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let mut headers = parts.headers;
    strip_request_headers(&mut headers);

    let reply = snapshot
        .upstreams
        .forward(
            upstream,
            parts.method,
            route.upstream_path(parts.uri.path()),
            parts.uri.query(),
            headers,
            body,
        )
        .await
        .inspect_err(|e| metrics::record_upstream_error(&upstream.name, e.code()))?;

    shape_upstream_response(reply).await
}
