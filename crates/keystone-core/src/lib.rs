//! Keystone Core Library
//!
//! Domain models, error types, configuration, encryption and the pure business rules
//! (authorization, reservations, billing, payments) shared by every Keystone crate.
//! Nothing in here performs I/O.

pub mod access;
pub mod billing;
pub mod config;
pub mod constants;
pub mod context;
pub mod encryption;
pub mod error;
pub mod identity;
pub mod models;
pub mod money;
pub mod payments;
pub mod reservation;

// Re-export commonly used types
pub use config::{AppConfig, AuthSettings, BaseConfig, Config, GatewaySettings};
pub use context::RequestContext;
pub use encryption::EncryptionService;
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel};
