//! Amenity reservations
//!
//! Slot generation, the booking lifecycle and recurring series. Capacity accounting
//! happens inside the store's confirm and cancel transactions; this layer validates input,
//! materializes occurrences and notifies residents of status changes.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime};
use keystone_core::models::{
    AmenityBooking, AmenitySlot, AuditEnvelope, BookingStatus, ExceptionType, NewBooking,
    NotificationTemplate, RecurrenceException, SlotGenerationReport, SlotGenerationRequest,
    SlotItemError,
};
use keystone_core::reservation::{booking, recurrence, slots, Occurrence};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::ReservationStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::notifier::Notifier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectBooking {
    pub rejection_reason: Option<String>,
    pub rejection_remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateBooking {
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewException {
    pub occurrence_date: NaiveDate,
    pub exception_type: ExceptionType,
    pub new_booking_date: Option<NaiveDate>,
    pub new_start_time: Option<NaiveTime>,
    pub new_end_time: Option<NaiveTime>,
}

#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn ReservationStore>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    horizon_days: i64,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        horizon_days: i64,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            horizon_days,
        }
    }

    fn horizon_end(&self, from: NaiveDate) -> NaiveDate {
        let today = self.clock.now().date_naive();
        from.max(today) + Duration::days(self.horizon_days)
    }

    /// Generate slots for every date in the range. Per-slot failures are reported rather
    /// than aborting the batch.
    #[tracing::instrument(skip(self, ctx, req), fields(amenity_id = %req.amenity_id))]
    pub async fn generate_slots(
        &self,
        ctx: &RequestContext,
        req: &SlotGenerationRequest,
    ) -> AppResult<SlotGenerationReport> {
        let planned = slots::plan_slots(req)?;
        self.store
            .get_amenity(ctx.tenant_id, req.amenity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("amenity {}", req.amenity_id)))?;

        if req.delete_existing {
            let removed = self
                .store
                .delete_slots(ctx.tenant_id, req.amenity_id, req.from_date, req.to_date, ctx.user_id)
                .await?;
            tracing::debug!(removed, "Existing slots removed before regeneration");
        }

        let now = self.clock.now();
        let mut candidates: Vec<AmenitySlot> = planned
            .iter()
            .map(|p| AmenitySlot {
                audit: AuditEnvelope::stamp_create_at(ctx, now),
                amenity_id: req.amenity_id,
                slot_date: p.slot_date,
                slot_start_time: p.start,
                slot_end_time: p.end,
                slot_duration_minutes: p.duration_minutes,
                is_available: true,
                total_bookings: 0,
                max_concurrent_bookings: req.max_concurrent_bookings,
            })
            .collect();

        let blackouts = self
            .store
            .list_blackouts(ctx.tenant_id, req.amenity_id, req.from_date, req.to_date)
            .await?;
        let blocked = slots::apply_blackouts(&mut candidates, &blackouts);
        if blocked > 0 {
            tracing::debug!(blocked, "Blackouts cover generated slots");
        }

        let mut report = SlotGenerationReport::default();
        for slot in &candidates {
            match self.store.upsert_slot(slot).await {
                Ok(created) => {
                    if created {
                        report.created_count += 1;
                    } else {
                        report.updated_count += 1;
                    }
                    if !slot.is_available {
                        report.updated_due_to_blackout += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        slot_date = %slot.slot_date,
                        slot_start_time = %slot.slot_start_time,
                        "Slot upsert failed"
                    );
                    report.error_count += 1;
                    report.errors.push(SlotItemError {
                        slot_date: slot.slot_date,
                        slot_start_time: slot.slot_start_time,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.summary = format!(
            "{} created, {} updated, {} failed, {} blocked by blackout",
            report.created_count,
            report.updated_count,
            report.error_count,
            report.updated_due_to_blackout
        );

        tracing::info!(
            tenant_id = %ctx.tenant_id,
            created = report.created_count,
            updated = report.updated_count,
            blacked_out = report.updated_due_to_blackout,
            failed = report.error_count,
            "Slot generation finished"
        );
        Ok(report)
    }

    pub async fn list_slots(
        &self,
        ctx: &RequestContext,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenitySlot>> {
        if from > to {
            return Err(AppError::InvalidInput(
                "from_date must not be after to_date".to_string(),
            ));
        }
        self.store.list_slots(ctx.tenant_id, amenity_id, from, to).await
    }

    /// Checks the window against blackouts and slot availability on that date.
    async fn ensure_bookable(
        &self,
        ctx: &RequestContext,
        amenity_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        selected: &[Uuid],
    ) -> AppResult<()> {
        let blackouts = self
            .store
            .list_blackouts(ctx.tenant_id, amenity_id, date, date)
            .await?;
        if let Some(b) = blackouts.iter().find(|b| b.covers(date, start, end)) {
            return Err(AppError::InvalidStatus(format!(
                "amenity is unavailable on {}: {}",
                date, b.reason
            )));
        }

        let day_slots = self.store.list_slots(ctx.tenant_id, amenity_id, date, date).await?;
        let occupied: Vec<&AmenitySlot> = if selected.is_empty() {
            day_slots.iter().filter(|s| s.overlaps(date, start, end)).collect()
        } else {
            let mut found = Vec::with_capacity(selected.len());
            for id in selected {
                let slot = day_slots
                    .iter()
                    .find(|s| s.id() == *id)
                    .ok_or_else(|| AppError::InvalidInput(format!("slot {} is not on {}", id, date)))?;
                if !slot.overlaps(date, start, end) {
                    return Err(AppError::InvalidInput(format!(
                        "slot {} does not overlap the requested window",
                        id
                    )));
                }
                found.push(slot);
            }
            found
        };

        if let Some(full) = occupied.iter().find(|s| !s.has_capacity()) {
            return Err(AppError::InvalidStatus(format!(
                "slot {} on {} is not available",
                full.slot_start_time, full.slot_date
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, ctx, input), fields(amenity_id = %input.amenity_id))]
    pub async fn create_booking(
        &self,
        ctx: &RequestContext,
        input: &NewBooking,
    ) -> AppResult<AmenityBooking> {
        booking::validate_window(input.start_time, input.end_time)?;
        if input.is_recurring {
            recurrence::validate_rule(&input.recurrence)?;
        }
        if ctx.is_resident() && ctx.resident_id != Some(input.resident_id) {
            return Err(AppError::PermissionDenied(
                "residents may only book for themselves".to_string(),
            ));
        }

        let amenity = self
            .store
            .get_amenity(ctx.tenant_id, input.amenity_id)
            .await?
            .filter(|a| a.active)
            .ok_or_else(|| AppError::NotFound(format!("amenity {}", input.amenity_id)))?;

        self.ensure_bookable(
            ctx,
            amenity.id(),
            input.booking_date,
            input.start_time,
            input.end_time,
            &input.selected_slot_ids,
        )
        .await?;

        let pending = booking::new_booking(ctx, input, self.clock.now());
        let created = self.store.insert_booking(&pending).await?;

        if created.is_recurring {
            let horizon = self.horizon_end(created.booking_date);
            self.materialize_parent(ctx, &created, horizon).await?;
        }

        tracing::info!(
            booking_id = %created.id(),
            tenant_id = %ctx.tenant_id,
            recurring = created.is_recurring,
            "Booking requested"
        );
        Ok(created)
    }

    pub async fn get_booking(&self, ctx: &RequestContext, booking_id: Uuid) -> AppResult<AmenityBooking> {
        self.store
            .get_booking(ctx, booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))
    }

    pub async fn confirm(&self, ctx: &RequestContext, booking_id: Uuid) -> AppResult<AmenityBooking> {
        // Visibility check first; the store confirms by id.
        self.get_booking(ctx, booking_id).await?;
        let confirmed = self
            .store
            .confirm_booking(ctx.tenant_id, booking_id, ctx.user_id, self.clock.now())
            .await?;
        self.notify(ctx, &confirmed, NotificationTemplate::BookingConfirmed, None)
            .await;
        Ok(confirmed)
    }

    pub async fn reject(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        input: &RejectBooking,
    ) -> AppResult<AmenityBooking> {
        let mut current = self.get_booking(ctx, booking_id).await?;
        booking::reject(
            &mut current,
            input.rejection_reason.as_deref(),
            input.rejection_remarks.as_deref(),
            ctx.user_id,
            self.clock.now(),
        )?;
        current.audit.stamp_update(ctx);
        let rejected = self.store.update_booking(&current).await?;

        tracing::info!(booking_id = %booking_id, tenant_id = %ctx.tenant_id, "Booking rejected");
        self.notify(
            ctx,
            &rejected,
            NotificationTemplate::BookingRejected,
            rejected.rejection_reason.clone(),
        )
        .await;
        Ok(rejected)
    }

    /// Cancelling an already cancelled booking returns it unchanged.
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
    ) -> AppResult<AmenityBooking> {
        let (cancelled, outcome) = self
            .store
            .cancel_booking(ctx, booking_id, reason, self.clock.now())
            .await?;
        if outcome.changed {
            self.notify(
                ctx,
                &cancelled,
                NotificationTemplate::BookingCancelled,
                reason.map(str::to_string),
            )
            .await;
        }
        Ok(cancelled)
    }

    pub async fn duplicate(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        input: &DuplicateBooking,
    ) -> AppResult<AmenityBooking> {
        let source = self.get_booking(ctx, booking_id).await?;
        let mut copy = booking::duplicate(
            &source,
            ctx,
            input.booking_date,
            input.start_time,
            input.end_time,
            self.clock.now(),
        )?;
        // Slot ids are date-bound; the copy re-resolves its slots on confirmation.
        copy.slot_id = None;
        copy.selected_slot_ids.clear();

        self.ensure_bookable(
            ctx,
            copy.amenity_id,
            copy.booking_date,
            copy.start_time,
            copy.end_time,
            &[],
        )
        .await?;
        self.store.insert_booking(&copy).await
    }

    async fn recurring_parent(&self, ctx: &RequestContext, parent_id: Uuid) -> AppResult<AmenityBooking> {
        let parent = self.get_booking(ctx, parent_id).await?;
        if !parent.is_recurring || parent.parent_booking_id.is_some() {
            return Err(AppError::InvalidInput(format!(
                "booking {} is not a recurring series",
                parent_id
            )));
        }
        Ok(parent)
    }

    /// Occurrences of a series up to `horizon_end`, exceptions applied.
    pub async fn occurrences(
        &self,
        ctx: &RequestContext,
        parent_id: Uuid,
        horizon_end: Option<NaiveDate>,
    ) -> AppResult<Vec<Occurrence>> {
        let parent = self.recurring_parent(ctx, parent_id).await?;
        let exceptions = self.store.list_exceptions(ctx.tenant_id, parent_id).await?;
        let horizon = horizon_end.unwrap_or_else(|| self.horizon_end(parent.booking_date));
        Ok(recurrence::expand(
            &parent.recurrence,
            parent.booking_date,
            parent.start_time,
            parent.end_time,
            &exceptions,
            horizon,
        ))
    }

    /// Write child rows for occurrences up to `horizon_end`. Existing children are kept.
    pub async fn materialize(
        &self,
        ctx: &RequestContext,
        parent_id: Uuid,
        horizon_end: Option<NaiveDate>,
    ) -> AppResult<usize> {
        let parent = self.recurring_parent(ctx, parent_id).await?;
        let horizon = horizon_end.unwrap_or_else(|| self.horizon_end(parent.booking_date));
        self.materialize_parent(ctx, &parent, horizon).await
    }

    async fn materialize_parent(
        &self,
        ctx: &RequestContext,
        parent: &AmenityBooking,
        horizon_end: NaiveDate,
    ) -> AppResult<usize> {
        let exceptions = self.store.list_exceptions(ctx.tenant_id, parent.id()).await?;
        let now = self.clock.now();
        // The parent row stands for the first occurrence.
        let children: Vec<AmenityBooking> = recurrence::expand(
            &parent.recurrence,
            parent.booking_date,
            parent.start_time,
            parent.end_time,
            &exceptions,
            horizon_end,
        )
        .iter()
        .filter(|o| o.occurrence_date != parent.booking_date)
        .map(|o| booking::occurrence_child(parent, o, ctx, now))
        .collect();

        if children.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.insert_children(&children).await?;
        tracing::debug!(
            parent_id = %parent.id(),
            inserted,
            horizon_end = %horizon_end,
            "Occurrences materialized"
        );
        Ok(inserted)
    }

    /// Record a skip, move or cancellation for one occurrence and rewrite its child row.
    /// A confirmed child may only be cancelled; skipping or moving it needs a cancel first.
    #[tracing::instrument(skip(self, ctx, input), fields(parent_id = %parent_id))]
    pub async fn add_exception(
        &self,
        ctx: &RequestContext,
        parent_id: Uuid,
        input: &NewException,
    ) -> AppResult<RecurrenceException> {
        let parent = self.recurring_parent(ctx, parent_id).await?;
        let horizon = self.horizon_end(input.occurrence_date);
        let in_series = recurrence::series_dates(&parent.recurrence, parent.booking_date, horizon)
            .contains(&input.occurrence_date);
        if !in_series {
            return Err(AppError::InvalidInput(format!(
                "{} is not an occurrence of booking {}",
                input.occurrence_date, parent_id
            )));
        }
        if input.occurrence_date == parent.booking_date {
            return Err(AppError::InvalidInput(
                "the first occurrence is the booking itself; cancel or duplicate it instead"
                    .to_string(),
            ));
        }

        let (new_start, new_end) = match input.exception_type {
            ExceptionType::Modify => {
                let start = input.new_start_time.unwrap_or(parent.start_time);
                let end = input.new_end_time.unwrap_or(parent.end_time);
                if input.new_start_time.is_none()
                    && input.new_end_time.is_none()
                    && input.new_booking_date.is_none()
                {
                    return Err(AppError::MissingRequiredParam(
                        "new_booking_date or new_start_time/new_end_time".to_string(),
                    ));
                }
                booking::validate_window(start, end)?;
                (input.new_start_time, input.new_end_time)
            }
            _ => (None, None),
        };

        let now = self.clock.now();
        let exception = RecurrenceException {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            parent_booking_id: parent_id,
            occurrence_date: input.occurrence_date,
            exception_type: input.exception_type,
            new_start_time: new_start,
            new_end_time: new_end,
            new_booking_date: match input.exception_type {
                ExceptionType::Modify => input.new_booking_date,
                _ => None,
            },
        };

        let child = self
            .store
            .list_children(ctx.tenant_id, parent_id)
            .await?
            .into_iter()
            .find(|c| c.occurrence_date == Some(input.occurrence_date));

        let Some(mut child) = child else {
            return self.store.apply_exception(&exception, None).await;
        };

        if child.status == BookingStatus::Confirmed {
            if input.exception_type != ExceptionType::Cancel {
                return Err(AppError::InvalidStatus(
                    "a confirmed occurrence must be cancelled before it can be skipped or moved"
                        .to_string(),
                ));
            }
            let reason = "occurrence cancelled";
            let (saved, cancelled, outcome) = self
                .store
                .cancel_occurrence(ctx, &exception, child.id(), Some(reason), now)
                .await?;
            if outcome.changed {
                self.notify(
                    ctx,
                    &cancelled,
                    NotificationTemplate::BookingCancelled,
                    Some(reason.to_string()),
                )
                .await;
            }
            return Ok(saved);
        }

        match input.exception_type {
            ExceptionType::Skip => child.audit.soft_delete(ctx),
            ExceptionType::Cancel => {
                booking::cancel(&mut child, Some("occurrence cancelled"), ctx, now)?;
                child.audit.stamp_update(ctx);
            }
            ExceptionType::Modify => {
                child.booking_date = exception.new_booking_date.unwrap_or(input.occurrence_date);
                child.start_time = exception.new_start_time.unwrap_or(parent.start_time);
                child.end_time = exception.new_end_time.unwrap_or(parent.end_time);
                child.audit.stamp_update(ctx);
            }
        }
        self.store.apply_exception(&exception, Some(&child)).await
    }

    async fn notify(
        &self,
        ctx: &RequestContext,
        booking: &AmenityBooking,
        template: NotificationTemplate,
        reason: Option<String>,
    ) {
        self.notifier
            .notify_resident(
                ctx,
                booking.resident_id,
                template,
                json!({
                    "booking_id": booking.id(),
                    "amenity_id": booking.amenity_id,
                    "booking_date": booking.booking_date,
                    "start_time": booking.start_time,
                    "end_time": booking.end_time,
                    "reason": reason,
                }),
            )
            .await;
    }
}
