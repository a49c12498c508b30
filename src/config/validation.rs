//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing upstreams and rules)
//! - Validate value ranges (windows and delays non-zero and at most a year, addresses parse)
//! - Check that upstream API keys form valid HTTP headers
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::config::schema::GatewayConfig;

/// Upper bound for every configured window, delay and interval.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address '{0}' is not a socket address")]
    InvalidBindAddress(String),

    #[error("duplicate upstream name '{0}'")]
    DuplicateUpstream(String),

    #[error("upstream '{name}' has invalid base_url '{url}'")]
    InvalidUpstreamUrl { name: String, url: String },

    #[error("upstream '{0}' has an api_key or api_key_header that is not a valid HTTP header")]
    InvalidApiKey(String),

    #[error("route '{route}' references unknown upstream '{upstream}'")]
    UnknownUpstream { route: String, upstream: String },

    #[error("route '{route}' references unknown rate limit rule '{rule}'")]
    UnknownRule { route: String, rule: String },

    #[error("duplicate rate limit rule '{0}'")]
    DuplicateRule(String),

    #[error("rate limit rule name '{0}' must be non-empty and must not contain ':'")]
    InvalidRuleName(String),

    #[error("rate limit rule '{0}' has a zero-length window")]
    ZeroWindow(String),

    #[error("rate_limit.default_rule '{0}' is not defined")]
    UnknownDefaultRule(String),

    #[error("registry.max_backoff_ms must be >= registry.base_backoff_ms")]
    BackoffRange,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} exceeds the maximum of {max} seconds", max = MAX_DURATION_SECS)]
    TooLong(String),
}

fn check_secs(errors: &mut Vec<ValidationError>, field: impl Into<String>, secs: u64) {
    if secs > MAX_DURATION_SECS {
        errors.push(ValidationError::TooLong(field.into()));
    }
}

fn check_millis(errors: &mut Vec<ValidationError>, field: &str, millis: u64) {
    check_secs(errors, field, millis.div_ceil(1_000));
}

/// Validate a parsed configuration, collecting every problem.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let mut upstreams = HashSet::new();
    for upstream in &config.upstreams {
        if !upstreams.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateUpstream(upstream.name.clone()));
        }
        if Url::parse(&upstream.base_url).is_err() {
            errors.push(ValidationError::InvalidUpstreamUrl {
                name: upstream.name.clone(),
                url: upstream.base_url.clone(),
            });
        }
        if let Some(key) = &upstream.api_key {
            let header_ok = HeaderName::from_bytes(upstream.api_key_header.as_bytes()).is_ok();
            if !header_ok || HeaderValue::from_str(key).is_err() {
                errors.push(ValidationError::InvalidApiKey(upstream.name.clone()));
            }
        }
    }

    let mut rules = HashSet::new();
    for rule in &config.rate_limit.rules {
        if !rules.insert(rule.name.as_str()) {
            errors.push(ValidationError::DuplicateRule(rule.name.clone()));
        }
        if rule.name.is_empty() || rule.name.contains(':') {
            errors.push(ValidationError::InvalidRuleName(rule.name.clone()));
        }
        if rule.window_secs == 0 {
            errors.push(ValidationError::ZeroWindow(rule.name.clone()));
        }
        check_secs(
            &mut errors,
            format!("rate_limit.rules.{}.window_secs", rule.name),
            rule.window_secs,
        );
    }

    if config.rate_limit.enabled && !rules.contains(config.rate_limit.default_rule.as_str()) {
        errors.push(ValidationError::UnknownDefaultRule(
            config.rate_limit.default_rule.clone(),
        ));
    }

    for route in &config.routes {
        if !upstreams.contains(route.upstream.as_str()) {
            errors.push(ValidationError::UnknownUpstream {
                route: route.name.clone(),
                upstream: route.upstream.clone(),
            });
        }
        if let Some(rule) = &route.rate_limit {
            if !rules.contains(rule.as_str()) {
                errors.push(ValidationError::UnknownRule {
                    route: route.name.clone(),
                    rule: rule.clone(),
                });
            }
        }
    }

    if config.registry.max_backoff_ms < config.registry.base_backoff_ms {
        errors.push(ValidationError::BackoffRange);
    }
    if config.registry.failure_threshold == 0 {
        errors.push(ValidationError::Zero("registry.failure_threshold"));
    }
    if config.registry.sweep_interval_secs == 0 {
        errors.push(ValidationError::Zero("registry.sweep_interval_secs"));
    }
    if config.rate_limit.sweep_interval_secs == 0 {
        errors.push(ValidationError::Zero("rate_limit.sweep_interval_secs"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.request_secs"));
    }

    check_millis(&mut errors, "registry.cooldown_ms", config.registry.cooldown_ms);
    check_millis(&mut errors, "registry.max_backoff_ms", config.registry.max_backoff_ms);
    check_secs(&mut errors, "registry.stale_after_secs", config.registry.stale_after_secs);
    check_secs(&mut errors, "registry.sweep_interval_secs", config.registry.sweep_interval_secs);
    check_secs(&mut errors, "rate_limit.sweep_interval_secs", config.rate_limit.sweep_interval_secs);
    check_secs(&mut errors, "timeouts.connect_secs", config.timeouts.connect_secs);
    check_secs(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
