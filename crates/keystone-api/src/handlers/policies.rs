//! Policies and resident acceptance.

use crate::auth::permissions::{ResidentAccess, MODULE_POLICIES};
use crate::auth::{authorize, Caller};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use keystone_core::models::{Action, PolicyChanges, PolicyStatus};
use keystone_core::AppError;
use keystone_infra::ErrorResponse;
use keystone_services::NewPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct PolicyQuery {
    pub status: Option<PolicyStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptanceQuery {
    /// Comma separated policy ids.
    pub policy_ids: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptResponse {
    pub newly_accepted: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/policies",
    tag = "policies",
    params(("status" = Option<String>, Query, description = "DRAFT, ACTIVE or ARCHIVED")),
    responses((status = 200, description = "Policies of the tenant"))
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn list_policies(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(query): Query<PolicyQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_POLICIES, Action::View, ResidentAccess::SelfService).await?;
    let policies = state.policies.list(&ctx, query.status).await?;
    Ok(Json(policies))
}

#[utoipa::path(
    post,
    path = "/api/v1/policies",
    tag = "policies",
    responses(
        (status = 201, description = "Policy created at version 1"),
        (status = 400, description = "Missing name or content", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<NewPolicy>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_POLICIES, Action::Create, ResidentAccess::Denied).await?;
    let policy = state.policies.create(&ctx, &input).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/policies/{id}",
    tag = "policies",
    params(("id" = String, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Policy updated; new content bumps the version"),
        (status = 404, description = "Policy not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, policy_id = %policy_id))]
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(policy_id): Path<Uuid>,
    ValidatedJson(changes): ValidatedJson<PolicyChanges>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_POLICIES, Action::Update, ResidentAccess::Denied).await?;
    let policy = state.policies.update(&ctx, policy_id, &changes).await?;
    Ok(Json(policy))
}

#[utoipa::path(
    post,
    path = "/api/v1/policies/{id}/accept",
    tag = "policies",
    params(("id" = String, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Current version accepted"),
        (status = 404, description = "Policy not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, policy_id = %policy_id))]
pub async fn accept_policy(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(policy_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let newly_accepted = state.policies.accept(&ctx, policy_id).await?;
    Ok(Json(AcceptResponse { newly_accepted }))
}

#[utoipa::path(
    get,
    path = "/api/v1/policies/acceptance",
    tag = "policies",
    params(("policy_ids" = String, Query, description = "Comma separated policy IDs")),
    responses(
        (status = 200, description = "Whether the caller accepted each policy's latest version"),
        (status = 400, description = "Malformed policy id", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn acceptance_status(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(query): Query<AcceptanceQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    let policy_ids = query
        .policy_ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Uuid>()
                .map_err(|_| AppError::InvalidInput(format!("invalid policy id: {}", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let statuses = state.policies.latest_accepted(&ctx, &policy_ids).await?;
    Ok(Json(statuses))
}
