use crate::error::HttpAppError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use keystone_core::{AppError, RequestContext};
use uuid::Uuid;

/// Header naming the tenant on routes that run before a session exists.
pub const TENANT_HEADER: &str = "X-Tenant-ID";

/// The authenticated caller, bound by [`super::middleware::auth_middleware`].
#[derive(Debug, Clone)]
pub struct Caller(pub RequestContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = HttpAppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .map(Caller)
            .ok_or_else(|| {
                HttpAppError(AppError::Unauthorized(
                    "Missing request context".to_string(),
                ))
            })
    }
}

/// Tenant id from [`TENANT_HEADER`], for sign-in and OTP.
#[derive(Debug, Clone, Copy)]
pub struct TenantHeader(pub Uuid);

impl<S> FromRequestParts<S> for TenantHeader
where
    S: Send + Sync,
{
    type Rejection = HttpAppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| HttpAppError(AppError::MissingRequiredParam(TENANT_HEADER.to_string())))?;
        raw.trim()
            .parse()
            .map(TenantHeader)
            .map_err(|_| HttpAppError(AppError::InvalidInput(format!("{} must be a UUID", TENANT_HEADER))))
    }
}
