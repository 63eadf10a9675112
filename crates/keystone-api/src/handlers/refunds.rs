use crate::auth::permissions::{ResidentAccess, MODULE_BILLING};
use crate::auth::{authorize, Caller};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use keystone_core::models::{Action, RefundRequestInput};
use keystone_infra::ErrorResponse;
use std::sync::Arc;
use uuid::Uuid;

#[utoipa::path(
    post,
    path = "/api/v1/bill-refund-requests",
    tag = "refunds",
    responses(
        (status = 201, description = "Refund request created and processed"),
        (status = 400, description = "Refund exceeds the paid amount or breaks a refund rule", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %input.bill))]
pub async fn create_refund_request(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<RefundRequestInput>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Create, ResidentAccess::Denied).await?;
    let view = state.refunds.create(&ctx, &input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[utoipa::path(
    get,
    path = "/api/v1/bill-refund-requests/{id}",
    tag = "refunds",
    params(("id" = String, Path, description = "Refund request ID")),
    responses(
        (status = 200, description = "Refund request with its refund transactions"),
        (status = 404, description = "Refund request not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, request_id = %request_id))]
pub async fn get_refund_request(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::View, ResidentAccess::Denied).await?;
    let view = state.refunds.get(&ctx, request_id).await?;
    Ok(Json(view))
}

/// Retry the refund transactions still pending, e.g. after a gateway outage.
#[utoipa::path(
    post,
    path = "/api/v1/bill-refund-requests/{id}/process",
    tag = "refunds",
    params(("id" = String, Path, description = "Refund request ID")),
    responses(
        (status = 200, description = "Refund request after the processing run"),
        (status = 404, description = "Refund request not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, request_id = %request_id))]
pub async fn process_refund_request(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Update, ResidentAccess::Denied).await?;
    let view = state.refunds.process(&ctx, request_id).await?;
    Ok(Json(view))
}
