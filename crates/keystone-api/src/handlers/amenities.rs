//! Amenity slots and bookings.

use crate::auth::permissions::{ResidentAccess, MODULE_AMENITIES};
use crate::auth::{authorize, Caller};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use keystone_core::models::{Action, NewBooking, SlotGenerationRequest};
use keystone_infra::ErrorResponse;
use keystone_services::{DuplicateBooking, NewException, RejectBooking};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub amenity_id: Uuid,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBooking {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HorizonQuery {
    pub until: Option<NaiveDate>,
}

#[utoipa::path(
    post,
    path = "/api/v1/amenity-slots",
    tag = "amenities",
    responses(
        (status = 200, description = "Per-slot outcome of the bulk generation"),
        (status = 400, description = "Invalid window or interval", body = ErrorResponse),
        (status = 404, description = "Amenity not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, amenity_id = %request.amenity_id))]
pub async fn generate_slots(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(request): ValidatedJson<SlotGenerationRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Create, ResidentAccess::Denied).await?;
    let report = state.reservations.generate_slots(&ctx, &request).await?;
    Ok(Json(report))
}

#[utoipa::path(
    get,
    path = "/api/v1/amenity-slots",
    tag = "amenities",
    params(
        ("amenity_id" = String, Query, description = "Amenity ID"),
        ("from_date" = String, Query, description = "First date, inclusive"),
        ("to_date" = String, Query, description = "Last date, inclusive")
    ),
    responses((status = 200, description = "Slots in the range"))
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, amenity_id = %query.amenity_id))]
pub async fn list_slots(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(query): Query<SlotQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::View, ResidentAccess::SelfService).await?;
    let slots = state
        .reservations
        .list_slots(&ctx, query.amenity_id, query.from_date, query.to_date)
        .await?;
    Ok(Json(slots))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings",
    tag = "amenities",
    responses(
        (status = 201, description = "Booking requested (PENDING)"),
        (status = 400, description = "Window invalid or no capacity left", body = ErrorResponse),
        (status = 403, description = "Residents may only book for themselves", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, amenity_id = %input.amenity_id))]
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    ValidatedJson(input): ValidatedJson<NewBooking>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Create, ResidentAccess::SelfService).await?;
    let booking = state.reservations.create_booking(&ctx, &input).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

#[utoipa::path(
    get,
    path = "/api/v1/bookings/{id}",
    tag = "amenities",
    params(("id" = String, Path, description = "Booking ID")),
    responses(
        (status = 200, description = "Booking"),
        (status = 404, description = "Booking not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::View, ResidentAccess::SelfService).await?;
    let booking = state.reservations.get_booking(&ctx, booking_id).await?;
    Ok(Json(booking))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/confirm",
    tag = "amenities",
    params(("id" = String, Path, description = "Booking ID")),
    responses(
        (status = 200, description = "Booking confirmed"),
        (status = 400, description = "Not pending or slot full", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Update, ResidentAccess::Denied).await?;
    let booking = state.reservations.confirm(&ctx, booking_id).await?;
    Ok(Json(booking))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/reject",
    tag = "amenities",
    params(("id" = String, Path, description = "Booking ID")),
    responses(
        (status = 200, description = "Booking rejected"),
        (status = 400, description = "Booking is not pending", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn reject_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<RejectBooking>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Update, ResidentAccess::Denied).await?;
    let booking = state.reservations.reject(&ctx, booking_id, &input).await?;
    Ok(Json(booking))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/cancel",
    tag = "amenities",
    params(("id" = String, Path, description = "Booking ID")),
    responses(
        (status = 200, description = "Booking cancelled; repeat calls return it unchanged"),
        (status = 400, description = "Booking cannot be cancelled", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<CancelBooking>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Update, ResidentAccess::SelfService).await?;
    let booking = state
        .reservations
        .cancel(&ctx, booking_id, input.reason.as_deref())
        .await?;
    Ok(Json(booking))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/duplicate",
    tag = "amenities",
    params(("id" = String, Path, description = "Booking ID")),
    responses(
        (status = 201, description = "Copy created as a new PENDING booking"),
        (status = 400, description = "Window invalid or no capacity left", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn duplicate_booking(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<DuplicateBooking>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Create, ResidentAccess::SelfService).await?;
    let booking = state.reservations.duplicate(&ctx, booking_id, &input).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

#[utoipa::path(
    get,
    path = "/api/v1/bookings/{id}/occurrences",
    tag = "amenities",
    params(
        ("id" = String, Path, description = "Recurring parent booking ID"),
        ("until" = Option<String>, Query, description = "Last date to expand; defaults to the horizon")
    ),
    responses(
        (status = 200, description = "Expanded occurrences with exceptions applied"),
        (status = 400, description = "Booking is not recurring", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn list_occurrences(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
    Query(query): Query<HorizonQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::View, ResidentAccess::SelfService).await?;
    let occurrences = state
        .reservations
        .occurrences(&ctx, booking_id, query.until)
        .await?;
    Ok(Json(occurrences))
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/exceptions",
    tag = "amenities",
    params(("id" = String, Path, description = "Recurring parent booking ID")),
    responses(
        (status = 201, description = "Occurrence skipped, cancelled or rescheduled"),
        (status = 409, description = "Occurrence already has an exception", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %ctx.tenant_id, booking_id = %booking_id))]
pub async fn add_exception(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(input): ValidatedJson<NewException>,
) -> Result<impl IntoResponse, HttpAppError> {
    authorize(&state, &ctx, MODULE_AMENITIES, Action::Update, ResidentAccess::SelfService).await?;
    let exception = state
        .reservations
        .add_exception(&ctx, booking_id, &input)
        .await?;
    Ok((StatusCode::CREATED, Json(exception)))
}
