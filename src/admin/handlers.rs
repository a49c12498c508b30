use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::http::error::ApiError;
use crate::http::server::AppState;
use crate::resilience::request_registry::RegistrySnapshot;
use crate::security::rate_limit::RateLimitRule;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub forwarded_requests: u64,
    pub routes: usize,
    pub upstreams: usize,
}

#[derive(Serialize)]
pub struct LimitsSummary {
    pub enabled: bool,
    pub tracked_keys: usize,
    pub keys_by_rule: BTreeMap<String, usize>,
    pub rules: Vec<RateLimitRule>,
}

#[derive(Serialize)]
pub struct RegistrySummary {
    #[serde(flatten)]
    pub counts: RegistrySnapshot,
    pub cooldown_ms: u64,
    pub failure_threshold: u32,
}

#[derive(Serialize)]
pub struct Removed {
    pub removed: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let snapshot = state.snapshot();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started_at.elapsed().as_secs(),
        forwarded_requests: state.request_count.load(Ordering::Relaxed),
        routes: snapshot.router.routes().len(),
        upstreams: snapshot.upstreams.len(),
    })
}

pub async fn get_limits(State(state): State<AppState>) -> Json<LimitsSummary> {
    let snapshot = state.snapshot();
    Json(LimitsSummary {
        enabled: snapshot.config.rate_limit.enabled,
        tracked_keys: state.limiter.tracked_keys(),
        keys_by_rule: state.limiter.keys_by_rule(),
        rules: snapshot.config.rate_limit.rules.clone(),
    })
}

pub async fn reset_client(
    State(state): State<AppState>,
    Path(client): Path<String>,
) -> Json<Removed> {
    let removed = state.limiter.reset_client(&client);
    tracing::info!(client = %client, removed, "Rate limit state reset by admin");
    Json(Removed { removed })
}

pub async fn get_registry(State(state): State<AppState>) -> Json<RegistrySummary> {
    let policy = state.registry.policy();
    Json(RegistrySummary {
        counts: state.registry.snapshot(),
        cooldown_ms: policy.cooldown.as_millis() as u64,
        failure_threshold: policy.failure_threshold,
    })
}

pub async fn clear_registry_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    if state.registry.clear(&key) {
        tracing::info!(key = %key, "Registry key cleared by admin");
        Ok(Json(Removed { removed: 1 }))
    } else {
        Err(ApiError::NotFound)
    }
}
