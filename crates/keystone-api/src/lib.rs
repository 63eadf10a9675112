//! Keystone API Library
//!
//! HTTP handlers, authentication middleware and application setup for the Keystone
//! property-management backend.

mod api_doc;
pub mod auth;
pub mod constants;
pub mod error;
pub mod handlers;
pub mod setup;
pub mod state;

pub use api_doc::{get_openapi_spec, ApiDoc};
pub use keystone_infra::ErrorResponse;
pub use state::AppState;
