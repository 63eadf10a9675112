use crate::auth::permissions::{ResidentAccess, MODULE_ROLES};
use crate::auth::{authorize, Caller};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use keystone_core::models::{Action, ModulePermissionUpdate};
use keystone_infra::ErrorResponse;
use keystone_services::NewRole;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UpdateRolePermissions {
    pub permissions: Vec<ModulePermissionUpdate>,
}

#[utoipa::path(
    get,
    path = "/api/v1/roles",
    tag = "roles",
    responses(
        (status = 200, description = "Roles of the tenant"),
        (status = 403, description = "Permission denied", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_ROLES, Action::View, ResidentAccess::Denied).await?;
    let roles = state.authz.list_roles(&ctx).await?;
    Ok(Json(roles))
}

#[utoipa::path(
    post,
    path = "/api/v1/roles",
    tag = "roles",
    responses(
        (status = 201, description = "Role created with view-only or copied grants"),
        (status = 403, description = "Permission denied", body = ErrorResponse),
        (status = 409, description = "Role name taken", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn create_role(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<NewRole>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_ROLES, Action::Create, ResidentAccess::Denied).await?;
    let role = state.authz.create_role(&ctx, &input).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}/permissions",
    tag = "roles",
    params(("id" = String, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Module, submodule and attribute grants of the role"),
        (status = 404, description = "Role not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, role_id = %role_id))]
pub async fn role_permissions(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(role_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_ROLES, Action::View, ResidentAccess::Denied).await?;
    let grants = state.authz.role_permissions(&ctx, role_id).await?;
    Ok(Json(grants))
}

#[utoipa::path(
    patch,
    path = "/api/v1/roles/{id}",
    tag = "roles",
    params(("id" = String, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Grants replaced"),
        (status = 403, description = "Permission denied", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, role_id = %role_id))]
pub async fn update_role(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(role_id): Path<Uuid>,
    ValidatedJson(body): ValidatedJson<UpdateRolePermissions>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_ROLES, Action::Update, ResidentAccess::Denied).await?;
    let grants = state
        .authz
        .update_role_permissions(&ctx, role_id, &body.permissions)
        .await?;
    Ok(Json(grants))
}

#[utoipa::path(
    post,
    path = "/api/v1/roles/{id}/deactivate",
    tag = "roles",
    params(("id" = String, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Role deactivated"),
        (status = 400, description = "Role still has holders", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, role_id = %role_id))]
pub async fn deactivate_role(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(role_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_ROLES, Action::Delete, ResidentAccess::Denied).await?;
    let role = state.authz.deactivate_role(&ctx, role_id).await?;
    Ok(Json(role))
}
