//! withme.travel API gateway library.
//!
//! Sits between the web frontend and the managed database / third-party
//! APIs, adding per-client rate limiting, duplicate-call suppression with
//! failure backoff, and uniform JSON error responses.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod upstream;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
