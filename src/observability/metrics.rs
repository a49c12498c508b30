//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, route
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_rate_limited_total` (counter): rejections by rule
//! - `gateway_registry_rejections_total` (counter): rejections by reason
//! - `gateway_upstream_errors_total` (counter): failures by upstream and kind
//! - `gateway_tracked_keys` (gauge): live keys per in-memory table

use std::net::SocketAddr;
use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::routing::MatchedRoute;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, route: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("route", route.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(rule: &str) {
    counter!("gateway_rate_limited_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_registry_rejection(reason: &'static str) {
    counter!("gateway_registry_rejections_total", "reason" => reason).increment(1);
}

pub fn record_upstream_error(upstream: &str, kind: &'static str) {
    counter!(
        "gateway_upstream_errors_total",
        "upstream" => upstream.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_tracked_keys(table: &'static str, count: usize) {
    gauge!("gateway_tracked_keys", "table" => table).set(count as f64);
}

/// Outermost gateway middleware: request counter and latency histogram.
pub async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();

    let response = next.run(request).await;

    let route = response
        .extensions()
        .get::<MatchedRoute>()
        .map(|r| r.name.clone())
        .unwrap_or_else(|| "none".to_string());
    record_request(&method, response.status().as_u16(), &route, start);
    response
}
