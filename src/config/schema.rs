//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::security::rate_limit::{RateLimitRule, Strategy};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Route definitions mapping requests to upstreams.
    pub routes: Vec<RouteConfig>,

    /// Upstream API definitions (managed database, third-party APIs).
    pub upstreams: Vec<UpstreamConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Request registry (dedupe, cooldown, backoff) configuration.
    pub registry: RegistryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Route configuration mapping requests to an upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Upstream name to forward to.
    pub upstream: String,

    /// Remove `path_prefix` from the path before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,

    /// Rate limit rule applied to this route. Falls back to
    /// `rate_limit.default_rule` when absent.
    pub rate_limit: Option<String>,

    /// Guard this route with the request registry.
    #[serde(default)]
    pub dedupe: bool,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Upstream API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Unique upstream identifier.
    pub name: String,

    /// Base URL requests are forwarded to (e.g., "https://db.example.co/rest/v1").
    pub base_url: String,

    /// API key injected when the client did not send one.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Header carrying the API key.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

fn default_api_key_header() -> String {
    "apikey".to_string()
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Rule used by routes that do not name one.
    pub default_rule: String,

    /// Named rules.
    pub rules: Vec<RateLimitRule>,

    /// Interval between stale-key sweeps in seconds.
    pub sweep_interval_secs: u64,

    /// Use the first `X-Forwarded-For` hop as the client address.
    pub trust_forwarded_for: bool,

    /// Header carrying an authenticated user id set by a trusted auth layer.
    /// When present on a request it identifies the client instead of its IP.
    pub identity_header: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rule: "standard".to_string(),
            rules: vec![
                RateLimitRule {
                    name: "standard".to_string(),
                    limit: 100,
                    window_secs: 60,
                    strategy: Strategy::FixedWindow,
                },
                RateLimitRule {
                    name: "strict".to_string(),
                    limit: 10,
                    window_secs: 60,
                    strategy: Strategy::SlidingWindow,
                },
            ],
            sweep_interval_secs: 60,
            trust_forwarded_for: false,
            identity_header: None,
        }
    }
}

impl RateLimitConfig {
    /// Look up a rule by name.
    pub fn rule(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// Request registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum gap between the end of one call and the start of the next.
    pub cooldown_ms: u64,

    /// Consecutive failures before backoff kicks in.
    pub failure_threshold: u32,

    /// First backoff delay in milliseconds.
    pub base_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,

    /// Idle time after which an entry is dropped.
    pub stale_after_secs: u64,

    /// Interval between cleanup sweeps in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 500,
            failure_threshold: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            stale_after_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}
