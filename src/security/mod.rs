//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-client, per-rule window counting)
//!     → headers.rs (strip hop-by-hop before forwarding)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a limited request never reaches the upstream
//! - No trust in client-supplied identity unless configured

pub mod headers;
pub mod rate_limit;

pub use rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter, Strategy};
