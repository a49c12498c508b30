//! Per-client rate limiting with fixed and sliding windows.
//!
//! Counters live in a process-local `DashMap` keyed by `"{rule}:{client}"`.
//! Nothing is shared between gateway instances, so a deployment running N
//! replicas effectively allows N times the configured limit.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::http::error::ApiError;
use crate::http::request::ClientKey;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::routing::MatchedRoute;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Counting strategy for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter reset at the end of each window opened by the first request.
    #[default]
    FixedWindow,
    /// Rolling log of accepted request times.
    SlidingWindow,
}

/// A named rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    pub name: String,
    /// Requests allowed per window.
    pub limit: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub strategy: Strategy,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the client regains capacity.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Unix timestamp (seconds, rounded up) at which the window resets.
    pub fn reset_at_unix(&self) -> u64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        ceil_secs(now.saturating_add(self.reset_after))
    }

    /// Whole seconds a limited client should wait, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.reset_after).max(1)
    }

    /// Standard `X-RateLimit-*` headers, plus `Retry-After` when limited.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at_unix()));
        if !self.allowed {
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(self.retry_after_secs()),
            );
        }
        headers
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}

#[derive(Debug)]
enum WindowState {
    Fixed { started: Instant, count: u32 },
    Sliding { hits: VecDeque<Instant> },
}

#[derive(Debug)]
struct Entry {
    window: Duration,
    state: WindowState,
}

impl Entry {
    fn new(strategy: Strategy, window: Duration, now: Instant) -> Self {
        let state = match strategy {
            Strategy::FixedWindow => WindowState::Fixed { started: now, count: 0 },
            Strategy::SlidingWindow => WindowState::Sliding { hits: VecDeque::new() },
        };
        Self { window, state }
    }

    fn strategy(&self) -> Strategy {
        match self.state {
            WindowState::Fixed { .. } => Strategy::FixedWindow,
            WindowState::Sliding { .. } => Strategy::SlidingWindow,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        match &self.state {
            WindowState::Fixed { started, .. } => {
                now.saturating_duration_since(*started) >= self.window
            }
            WindowState::Sliding { hits } => hits
                .back()
                .map_or(true, |last| now.saturating_duration_since(*last) >= self.window),
        }
    }
}

/// In-memory rate limiter shared by all requests.
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: DashMap<String, Entry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a request from `client` against `rule`.
    pub fn check(&self, rule: &RateLimitRule, client: &str) -> RateLimitDecision {
        self.check_at(rule, client, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, rule: &RateLimitRule, client: &str, now: Instant) -> RateLimitDecision {
        let window = rule.window();
        let mut entry = self
            .entries
            .entry(format!("{}:{}", rule.name, client))
            .or_insert_with(|| Entry::new(rule.strategy, window, now));

        // Rule was reconfigured since this entry was created.
        if entry.strategy() != rule.strategy || entry.window != window {
            *entry = Entry::new(rule.strategy, window, now);
        }

        match &mut entry.state {
            WindowState::Fixed { started, count } => {
                if now.saturating_duration_since(*started) >= window {
                    *started = now;
                    *count = 0;
                }
                let allowed = *count < rule.limit;
                if allowed {
                    *count += 1;
                }
                RateLimitDecision {
                    allowed,
                    limit: rule.limit,
                    remaining: rule.limit.saturating_sub(*count),
                    reset_after: window.saturating_sub(now.saturating_duration_since(*started)),
                }
            }
            WindowState::Sliding { hits } => {
                while let Some(oldest) = hits.front() {
                    if now.saturating_duration_since(*oldest) >= window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                let allowed = (hits.len() as u64) < u64::from(rule.limit);
                if allowed {
                    hits.push_back(now);
                }
                let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
                let reset_after = hits.front().map_or(window, |oldest| {
                    window.saturating_sub(now.saturating_duration_since(*oldest))
                });
                RateLimitDecision {
                    allowed,
                    limit: rule.limit,
                    remaining: rule.limit.saturating_sub(used),
                    reset_after,
                }
            }
        }
    }

    /// Drop every entry whose window has fully elapsed. Returns the number removed.
    pub fn purge_stale(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        before.saturating_sub(self.entries.len())
    }

    /// Forget a client across every rule. Returns the number of entries removed.
    pub fn reset_client(&self, client: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| key.split_once(':').map_or(true, |(_, c)| c != client));
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Tracked key count per rule name.
    pub fn keys_by_rule(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter() {
            if let Some((rule, _)) = entry.key().split_once(':') {
                *counts.entry(rule.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Periodically purge stale keys until shutdown.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.purge_stale(Instant::now());
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.tracked_keys(), "Purged stale rate limit keys");
                    }
                    metrics::record_tracked_keys("rate_limit", self.tracked_keys());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rate limit sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Middleware enforcing the matched route's rule.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let snapshot = state.snapshot();
    let settings = &snapshot.config.rate_limit;
    if !settings.enabled {
        return next.run(request).await;
    }

    let rule_name = request
        .extensions()
        .get::<MatchedRoute>()
        .and_then(|route| route.rate_limit.clone())
        .unwrap_or_else(|| settings.default_rule.clone());

    let Some(rule) = settings.rule(&rule_name) else {
        tracing::warn!(rule = %rule_name, "Rate limit rule not found, passing request through");
        return next.run(request).await;
    };

    let client = request
        .extensions()
        .get::<ClientKey>()
        .map(|k| k.0.clone())
        .unwrap_or_default();

    let decision = state.limiter.check(rule, &client);
    if !decision.allowed {
        tracing::warn!(client = %client, rule = %rule.name, "Rate limit exceeded");
        metrics::record_rate_limited(&rule.name);
        let mut response = ApiError::RateLimited {
            retry_after: decision.reset_after,
        }
        .into_response();
        response.headers_mut().extend(decision.headers());
        return response;
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(decision.headers());
    response
}
