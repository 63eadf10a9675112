//! Bills, payments against them and payment-plan consent.

use crate::auth::permissions::{ResidentAccess, ENTITY_BILL, MODULE_BILLING};
use crate::auth::{authorize, Caller};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use keystone_core::models::{Action, BillInput, PayRequest, PayResponse, PaymentStatus};
use keystone_core::AppError;
use keystone_infra::ErrorResponse;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

const MAX_UPCOMING_INSTALLMENTS: usize = 60;

#[derive(Debug, Deserialize)]
pub struct CancelBill {
    pub cancellation_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelPayment {
    pub bill: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpcomingQuery {
    #[serde(default = "default_upcoming")]
    pub count: usize,
}

fn default_upcoming() -> usize {
    3
}

#[utoipa::path(
    post,
    path = "/api/v1/bills",
    tag = "billing",
    responses(
        (status = 201, description = "Bill created with computed totals"),
        (status = 400, description = "Invalid breakdown or rules", body = ErrorResponse),
        (status = 403, description = "Permission denied", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn create_bill(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<BillInput>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Create, ResidentAccess::Denied).await?;
    let aggregate = state.billing.create(&ctx, &input).await?;
    Ok((StatusCode::CREATED, Json(aggregate)))
}

#[utoipa::path(
    get,
    path = "/api/v1/bills/{id}",
    tag = "billing",
    params(("id" = String, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Bill with breakdown, applied rules and summaries; fields the caller may not see are omitted"),
        (status = 404, description = "Bill not found or outside the caller's scope", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %bill_id))]
pub async fn get_bill(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bill_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::View, ResidentAccess::SelfService).await?;
    let aggregate = state.billing.get(&ctx, bill_id).await?;
    let mut body = serde_json::to_value(&aggregate).map_err(AppError::from)?;
    if let Some(bill) = body.get_mut("bill") {
        state.authz.redact(&ctx, ENTITY_BILL, bill).await?;
    }
    Ok(Json(body))
}

#[utoipa::path(
    patch,
    path = "/api/v1/bills/{id}",
    tag = "billing",
    params(("id" = String, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Bill recalculated"),
        (status = 400, description = "Bill is no longer editable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %bill_id))]
pub async fn update_bill(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bill_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<BillInput>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Update, ResidentAccess::Denied).await?;
    let aggregate = state.billing.update(&ctx, bill_id, &input).await?;
    Ok(Json(aggregate))
}

#[utoipa::path(
    post,
    path = "/api/v1/bills/{id}/cancel",
    tag = "billing",
    params(("id" = String, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Bill cancelled with its cancellation code"),
        (status = 400, description = "Unknown reason or bill not cancellable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %bill_id))]
pub async fn cancel_bill(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bill_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<CancelBill>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Delete, ResidentAccess::Denied).await?;
    let bill = state
        .billing
        .cancel(&ctx, bill_id, &input.cancellation_reason)
        .await?;
    Ok(Json(bill))
}

/// Pay a bill, or consent to a payment plan when `payment_plan_id` is set. A sale the
/// gateway has not answered yet comes back as 202 with status PENDING.
#[utoipa::path(
    post,
    path = "/api/v1/bills/{id}/pay",
    tag = "billing",
    params(("id" = String, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Payment processed; extra_data carries widget fields"),
        (status = 201, description = "Payment plan consent recorded"),
        (status = 202, description = "Gateway outcome pending; the reconciler settles it"),
        (status = 400, description = "Invalid amount, method or instrument", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %bill_id))]
pub async fn pay_bill(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bill_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<PayRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Create, ResidentAccess::SelfService).await?;

    if request.payment_plan_id.is_some() {
        let plan = state.plans.process_consent(&ctx, bill_id, &request).await?;
        let response = PayResponse {
            payment_id: None,
            status: PaymentStatus::Pending,
            extra_data: serde_json::json!({ "bill_payment_plan": plan }),
        };
        return Ok((StatusCode::CREATED, Json(response)));
    }

    let response = state.payments.pay(&ctx, bill_id, &request).await?;
    let status = if response.status == PaymentStatus::Pending {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

#[utoipa::path(
    get,
    path = "/api/v1/bills/{id}/installments",
    tag = "billing",
    params(
        ("id" = String, Path, description = "Bill ID"),
        ("count" = Option<usize>, Query, description = "How many upcoming dates to list")
    ),
    responses(
        (status = 200, description = "Upcoming installment dates"),
        (status = 404, description = "Bill has no payment plan", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %bill_id))]
pub async fn upcoming_installments(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bill_id): Path<Uuid>,
    Query(query): Query<UpcomingQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::View, ResidentAccess::SelfService).await?;
    let count = query.count.clamp(1, MAX_UPCOMING_INSTALLMENTS);
    let dates = state.plans.upcoming(&ctx, bill_id, count).await?;
    Ok(Json(dates))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/cancel",
    tag = "billing",
    responses(
        (status = 200, description = "Last open gateway transaction voided"),
        (status = 404, description = "No open transaction", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, bill_id = %input.bill))]
pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<CancelPayment>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_BILLING, Action::Update, ResidentAccess::Denied).await?;
    let payment = state.payments.cancel_last(&ctx, input.bill).await?;
    Ok(Json(payment))
}
