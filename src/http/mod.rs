//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → request.rs (client identity)
//!     → [routing, rate limit, request registry middleware]
//!     → server.rs forward → upstream client
//!     → response.rs (shape reply, map database errors)
//!     → error.rs (uniform JSON errors)
//!     → Send to client
//! ```

pub mod error;
pub mod request;
pub mod response;
pub mod server;

pub use error::{ApiError, ErrorBody};
pub use request::ClientKey;
pub use server::{AppState, HttpServer};

pub const X_REQUEST_ID: &str = "x-request-id";
