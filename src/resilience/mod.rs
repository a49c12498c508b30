//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to a dedupe route:
//!     → request_registry.rs (reject duplicates, cooldown, backoff)
//!     → forward upstream
//!     → ticket.succeed() / ticket.fail() on the outcome
//!     → backoff.rs (delay once failures cross the threshold)
//! ```
//!
//! # Design Decisions
//! - Per-key state (not global): one failing endpoint does not block others
//! - Fail fast while backing off (no waiting for the upstream)
//! - State is process-local; replicas do not coordinate

pub mod backoff;
pub mod request_registry;

pub use request_registry::{Outcome, Rejection, RequestRegistry, RequestTicket};
