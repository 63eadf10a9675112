//! Sign-in, one-time codes and session tokens.

use crate::auth::TenantHeader;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use keystone_core::models::LocationDetail;
use keystone_infra::ErrorResponse;
use keystone_services::{LoginRequest, OtpRequest};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
    #[serde(default)]
    pub location_detail: Option<LocationDetail>,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    params(("X-Tenant-ID" = String, Header, description = "Tenant to sign in to")),
    responses(
        (status = 200, description = "Signed in; returns user, profile and token bundle"),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "Account locked", body = ErrorResponse),
        (status = 404, description = "Unknown tenant", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn login(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    ValidatedJson(request): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let response = state.auth.login(tenant_id, &request).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/otp",
    tag = "auth",
    params(("X-Tenant-ID" = String, Header, description = "Tenant of the user")),
    responses(
        (status = 200, description = "Code sent, or verified with a scoped token"),
        (status = 400, description = "Invalid or expired code, or resend too soon", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn otp(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    ValidatedJson(request): ValidatedJson<OtpRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let response = state.otp.handle(tenant_id, &request).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "auth",
    responses(
        (status = 200, description = "New token bundle"),
        (status = 401, description = "Refresh token invalid, expired or revoked", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let bundle = state
        .auth
        .refresh(&request.refresh_token, request.location_detail.as_ref())
        .await?;
    Ok(Json(bundle))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    responses(
        (status = 204, description = "Session closed"),
        (status = 401, description = "Unknown session", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<LogoutRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.auth.logout(&request.refresh).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/reset-password",
    tag = "auth",
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "Password rejected", body = ErrorResponse),
        (status = 401, description = "Reset token invalid or already used", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<ResetPasswordRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    state
        .auth
        .reset_password(&request.token, &request.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
