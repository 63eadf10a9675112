//! Keystone Infrastructure Library
//!
//! Shared plumbing for the HTTP server and the worker:
//! - Telemetry initialization
//! - Middleware (request ID, security headers)
//! - Per-key rate limiting
//! - SMTP delivery for email notifications
//! - The JSON error body

#[cfg(feature = "middleware")]
pub mod middleware;

pub mod telemetry;

pub mod error;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

#[cfg(feature = "email")]
pub mod email;

#[cfg(feature = "middleware")]
pub use middleware::{
    get_request_id, request_id_middleware, security_headers_middleware, RequestId,
};

pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat};

pub use error::ErrorResponse;

#[cfg(feature = "rate-limit")]
pub use rate_limit::RateLimiter;

#[cfg(feature = "email")]
pub use email::SmtpTransport;
