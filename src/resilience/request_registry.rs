//! Request registry: duplicate suppression, cooldown and failure backoff.
//!
//! # States (per key)
//! - Idle: no call running, free to start unless cooling down or blocked
//! - In flight: a [`RequestTicket`] is outstanding; duplicates are rejected
//! - Backing off: `failure_threshold` consecutive failures reached; calls
//!   are rejected until the backoff deadline passes
//!
//! # State Transitions
//! ```text
//! Idle → In flight: begin()
//! In flight → Idle: succeed() (failures reset) or ticket dropped
//! In flight → Idle/Backing off: fail() (backoff once threshold reached)
//! Backing off → Idle: deadline elapses
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::RegistryConfig;
use crate::http::error::ApiError;
use crate::http::request::ClientKey;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::routing::MatchedRoute;

/// Timing policy applied to every key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPolicy {
    pub cooldown: Duration,
    pub failure_threshold: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub stale_after: Duration,
}

impl From<&RegistryConfig> for RegistryPolicy {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            failure_threshold: config.failure_threshold.max(1),
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

/// Why a call was not allowed to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("An identical request is already in progress")]
    InFlight,

    #[error("Request repeated too quickly")]
    Cooldown { retry_after: Duration },

    #[error("Endpoint is backing off after {failures} consecutive failures")]
    BackingOff { retry_after: Duration, failures: u32 },
}

impl Rejection {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::InFlight => "in_flight",
            Rejection::Cooldown { .. } => "cooldown",
            Rejection::BackingOff { .. } => "backing_off",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Rejection::InFlight => None,
            Rejection::Cooldown { retry_after } | Rejection::BackingOff { retry_after, .. } => {
                Some(*retry_after)
            }
        }
    }
}

/// Result of a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct Entry {
    /// Id of the outstanding ticket, if any.
    ticket: Option<u64>,
    last_finished: Option<Instant>,
    last_seen: Instant,
    failures: u32,
    /// Backoff start and length.
    backoff: Option<(Instant, Duration)>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            ticket: None,
            last_finished: None,
            last_seen: now,
            failures: 0,
            backoff: None,
        }
    }

    /// Time left on the current backoff, if any.
    fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        let (since, length) = self.backoff?;
        let elapsed = now.saturating_duration_since(since);
        (elapsed < length).then(|| length - elapsed)
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.backoff_remaining(now).is_some()
    }
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, Entry>,
    policy: ArcSwap<RegistryPolicy>,
    next_ticket: AtomicU64,
}

/// Counts reported by [`RequestRegistry::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub tracked: usize,
    pub in_flight: usize,
    pub backing_off: usize,
}

/// Shared registry of request keys. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct RequestRegistry {
    inner: Arc<Inner>,
}

impl RequestRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                policy: ArcSwap::from_pointee(policy),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Replace the timing policy. Existing backoff deadlines are kept.
    pub fn set_policy(&self, policy: RegistryPolicy) {
        self.inner.policy.store(Arc::new(policy));
    }

    pub fn policy(&self) -> Arc<RegistryPolicy> {
        self.inner.policy.load_full()
    }

    /// Try to start a call for `key`.
    pub fn begin(&self, key: &str) -> Result<RequestTicket, Rejection> {
        self.begin_at(key, Instant::now())
    }

    pub fn begin_at(&self, key: &str, now: Instant) -> Result<RequestTicket, Rejection> {
        let policy = self.inner.policy.load();
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now));

        if entry.ticket.is_some() {
            return Err(Rejection::InFlight);
        }

        if let Some(retry_after) = entry.backoff_remaining(now) {
            return Err(Rejection::BackingOff {
                retry_after,
                failures: entry.failures,
            });
        }

        if let Some(finished) = entry.last_finished {
            let elapsed = now.saturating_duration_since(finished);
            if elapsed < policy.cooldown {
                return Err(Rejection::Cooldown {
                    retry_after: policy.cooldown - elapsed,
                });
            }
        }

        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        entry.ticket = Some(id);
        entry.last_seen = now;

        Ok(RequestTicket {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
            done: false,
        })
    }

    /// Drop idle entries not touched for `stale_after`. Returns the number removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let stale_after = self.inner.policy.load().stale_after;
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| {
            entry.ticket.is_some()
                || entry.is_blocked(now)
                || now.saturating_duration_since(entry.last_seen) < stale_after
        });
        before.saturating_sub(self.inner.entries.len())
    }

    /// Forget everything about a key. An outstanding ticket for it becomes a no-op.
    pub fn clear(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    /// Consecutive failures currently recorded for a key.
    pub fn failures(&self, key: &str) -> u32 {
        self.inner.entries.get(key).map_or(0, |e| e.failures)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let now = Instant::now();
        let mut snapshot = RegistrySnapshot {
            tracked: 0,
            in_flight: 0,
            backing_off: 0,
        };
        for entry in self.inner.entries.iter() {
            snapshot.tracked += 1;
            if entry.ticket.is_some() {
                snapshot.in_flight += 1;
            }
            if entry.is_blocked(now) {
                snapshot.backing_off += 1;
            }
        }
        snapshot
    }

    /// Periodically drop stale entries until shutdown.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup(Instant::now());
                    if removed > 0 {
                        tracing::debug!(removed, "Dropped stale request registry entries");
                    }
                    metrics::record_tracked_keys("registry", self.inner.entries.len());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Registry sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Proof that a call for a key is in flight.
///
/// Dropping a ticket without calling [`succeed`](Self::succeed) or
/// [`fail`](Self::fail) frees the key without recording an outcome.
#[derive(Debug)]
pub struct RequestTicket {
    inner: Arc<Inner>,
    key: String,
    id: u64,
    done: bool,
}

impl RequestTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn succeed(self) {
        self.finish_at(Outcome::Success, Instant::now());
    }

    /// Record a failure. Returns the backoff imposed, if the threshold was reached.
    pub fn fail(self) -> Option<Duration> {
        self.finish_at(Outcome::Failure, Instant::now())
    }

    pub fn finish_at(mut self, outcome: Outcome, now: Instant) -> Option<Duration> {
        self.done = true;
        let policy = self.inner.policy.load();
        let mut entry = self.inner.entries.get_mut(&self.key)?;
        if entry.ticket != Some(self.id) {
            return None;
        }

        entry.ticket = None;
        entry.last_finished = Some(now);
        entry.last_seen = now;

        match outcome {
            Outcome::Success => {
                entry.failures = 0;
                entry.backoff = None;
                None
            }
            Outcome::Failure => {
                entry.failures = entry.failures.saturating_add(1);
                if entry.failures < policy.failure_threshold {
                    return None;
                }
                let step = entry.failures - policy.failure_threshold + 1;
                let delay = calculate_backoff(step, policy.base_backoff_ms, policy.max_backoff_ms);
                entry.backoff = Some((now, delay));
                tracing::warn!(
                    key = %self.key,
                    failures = entry.failures,
                    delay_ms = delay.as_millis() as u64,
                    "Request key backing off"
                );
                Some(delay)
            }
        }
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(mut entry) = self.inner.entries.get_mut(&self.key) {
            if entry.ticket == Some(self.id) {
                entry.ticket = None;
                entry.last_seen = Instant::now();
            }
        }
    }
}

/// Middleware guarding `dedupe` routes with the registry.
///
/// Upstream 5xx responses count as failures.
pub async fn request_registry_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let dedupe = request
        .extensions()
        .get::<MatchedRoute>()
        .is_some_and(|route| route.dedupe);
    if !dedupe {
        return next.run(request).await;
    }

    let client = request
        .extensions()
        .get::<ClientKey>()
        .map(|k| k.0.as_str())
        .unwrap_or_default();
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let key = format!("{} {} {}", client, request.method(), target);

    let ticket = match state.registry.begin(&key) {
        Ok(ticket) => ticket,
        Err(rejection) => {
            tracing::info!(key = %key, reason = rejection.reason(), "Request rejected by registry");
            metrics::record_registry_rejection(rejection.reason());
            return ApiError::from(rejection).into_response();
        }
    };

    // The key is released once response headers are known; a streamed body
    // may still be in transit when the next identical call is admitted.
    let response = next.run(request).await;
    if response.status().is_server_error() {
        ticket.fail();
    } else {
        ticket.succeed();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RegistryPolicy {
        RegistryPolicy {
            cooldown: Duration::from_millis(500),
            failure_threshold: 2,
            base_backoff_ms: 1_000,
            max_backoff_ms: 8_000,
            stale_after: Duration::from_secs(60),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_rejects_duplicate_in_flight() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        let ticket = registry.begin_at("GET /trips", t0).unwrap();
        assert_eq!(registry.begin_at("GET /trips", t0).unwrap_err(), Rejection::InFlight);
        // Other keys are unaffected.
        assert!(registry.begin_at("GET /groups", t0).is_ok());

        ticket.finish_at(Outcome::Success, t0);
        assert_eq!(registry.snapshot().in_flight, 0);
    }

    #[test]
    fn test_cooldown_between_calls() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        registry
            .begin_at("k", t0)
            .unwrap()
            .finish_at(Outcome::Success, t0 + ms(100));

        match registry.begin_at("k", t0 + ms(300)) {
            Err(Rejection::Cooldown { retry_after }) => assert_eq!(retry_after, ms(300)),
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert!(registry.begin_at("k", t0 + ms(600)).is_ok());
    }

    #[test]
    fn test_backoff_after_threshold() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        let first = registry.begin_at("k", t0).unwrap().finish_at(Outcome::Failure, t0);
        assert_eq!(first, None);
        assert_eq!(registry.failures("k"), 1);

        let t1 = t0 + ms(600);
        let delay = registry
            .begin_at("k", t1)
            .unwrap()
            .finish_at(Outcome::Failure, t1)
            .expect("threshold reached");
        assert!(delay >= ms(1_000) && delay < ms(1_100));

        match registry.begin_at("k", t1 + ms(500)) {
            Err(Rejection::BackingOff { failures, retry_after }) => {
                assert_eq!(failures, 2);
                assert_eq!(retry_after, delay - ms(500));
            }
            other => panic!("expected backoff, got {:?}", other),
        }
        assert_eq!(registry.snapshot().backing_off, 1);

        // The next failure doubles the delay.
        let t2 = t1 + ms(1_200);
        let second = registry
            .begin_at("k", t2)
            .unwrap()
            .finish_at(Outcome::Failure, t2)
            .unwrap();
        assert!(second >= ms(2_000) && second < ms(2_200));
    }

    #[test]
    fn test_success_resets_streak() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        registry.begin_at("k", t0).unwrap().finish_at(Outcome::Failure, t0);
        let t1 = t0 + ms(600);
        registry.begin_at("k", t1).unwrap().finish_at(Outcome::Success, t1);
        assert_eq!(registry.failures("k"), 0);

        let t2 = t1 + ms(600);
        let none = registry.begin_at("k", t2).unwrap().finish_at(Outcome::Failure, t2);
        assert_eq!(none, None, "streak restarted after success");
    }

    #[test]
    fn test_dropped_ticket_releases_without_outcome() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        drop(registry.begin_at("k", t0).unwrap());
        assert_eq!(registry.failures("k"), 0);
        // No finish time recorded, so no cooldown either.
        assert!(registry.begin_at("k", t0).is_ok());
    }

    #[test]
    fn test_cleared_key_ignores_stale_ticket() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        let old = registry.begin_at("k", t0).unwrap();
        assert!(registry.clear("k"));
        let fresh = registry.begin_at("k", t0).unwrap();

        old.finish_at(Outcome::Failure, t0);
        assert_eq!(registry.begin_at("k", t0).unwrap_err(), Rejection::InFlight);
        fresh.finish_at(Outcome::Success, t0);
        assert_eq!(registry.failures("k"), 0);
    }

    #[test]
    fn test_cleanup_keeps_active_entries() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();

        registry.begin_at("idle", t0).unwrap().finish_at(Outcome::Success, t0);
        let _running = registry.begin_at("running", t0).unwrap();
        registry.begin_at("blocked", t0).unwrap().finish_at(Outcome::Failure, t0);
        let t1 = t0 + ms(600);
        registry.begin_at("blocked", t1).unwrap().finish_at(Outcome::Failure, t1);

        assert_eq!(registry.cleanup(t0 + ms(30_000)), 0);
        // Past stale_after, only the in-flight key survives (backoff has long expired).
        assert_eq!(registry.cleanup(t0 + ms(120_000)), 2);
        assert_eq!(registry.snapshot().tracked, 1);
    }

    #[test]
    fn test_policy_swap_applies_to_new_calls() {
        let registry = RequestRegistry::new(policy());
        let t0 = Instant::now();
        registry.begin_at("k", t0).unwrap().finish_at(Outcome::Success, t0);
        assert!(registry.begin_at("k", t0 + ms(100)).is_err());

        registry.set_policy(RegistryPolicy {
            cooldown: Duration::ZERO,
            ..policy()
        });
        assert!(registry.begin_at("k", t0 + ms(100)).is_ok());
    }

    #[test]
    fn test_huge_delays_do_not_overflow() {
        let registry = RequestRegistry::new(RegistryPolicy {
            cooldown: Duration::MAX,
            failure_threshold: 1,
            base_backoff_ms: u64::MAX,
            max_backoff_ms: u64::MAX,
            stale_after: Duration::MAX,
        });
        let t0 = Instant::now();

        registry.begin_at("cool", t0).unwrap().finish_at(Outcome::Success, t0);
        match registry.begin_at("cool", t0 + ms(10)) {
            Err(Rejection::Cooldown { retry_after }) => assert_eq!(retry_after, Duration::MAX - ms(10)),
            other => panic!("expected cooldown, got {:?}", other),
        }

        let delay = registry.begin_at("fail", t0).unwrap().finish_at(Outcome::Failure, t0);
        assert!(delay.is_some());
        assert!(matches!(
            registry.begin_at("fail", t0 + ms(10)),
            Err(Rejection::BackingOff { .. })
        ));
        assert_eq!(registry.cleanup(t0 + ms(10)), 0);
    }
}
