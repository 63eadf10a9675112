//! Bearer-token authentication and the per-request caller context.

pub mod context;
pub mod middleware;
pub mod permissions;

pub use context::{Caller, TenantHeader, TENANT_HEADER};
pub use middleware::{auth_middleware, AuthFailureLimiter, AuthState};
pub use permissions::authorize;
