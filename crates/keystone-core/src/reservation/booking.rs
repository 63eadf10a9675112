use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use super::recurrence::Occurrence;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::models::{
    AmenityBooking, AmenitySlot, AuditEnvelope, BookingStatus, NewBooking, RecurrenceRule,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// False when the booking was already cancelled.
    pub changed: bool,
    /// The booking held capacity that must be released.
    pub was_confirmed: bool,
}

pub fn validate_window(start: NaiveTime, end: NaiveTime) -> AppResult<()> {
    if start >= end {
        return Err(AppError::InvalidInput(
            "start_time must be before end_time".to_string(),
        ));
    }
    Ok(())
}

/// Capacity gate for a confirmation: CONFIRMED bookings overlapping the slot must stay
/// strictly below `max_concurrent_bookings`.
pub fn ensure_capacity(slot: &AmenitySlot, confirmed_overlapping: i64) -> AppResult<()> {
    if !slot.is_available {
        return Err(AppError::InvalidStatus(format!(
            "slot {} on {} is not available",
            slot.slot_start_time, slot.slot_date
        )));
    }
    if confirmed_overlapping >= slot.max_concurrent_bookings as i64 {
        return Err(AppError::InvalidStatus(format!(
            "slot {} on {} is fully booked",
            slot.slot_start_time, slot.slot_date
        )));
    }
    Ok(())
}

pub fn new_booking(ctx: &RequestContext, input: &NewBooking, now: DateTime<Utc>) -> AmenityBooking {
    let recurrence = if input.is_recurring {
        input.recurrence.clone()
    } else {
        RecurrenceRule::default()
    };
    AmenityBooking {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        amenity_id: input.amenity_id,
        resident_id: input.resident_id,
        slot_id: input.selected_slot_ids.first().copied(),
        selected_slot_ids: input.selected_slot_ids.clone(),
        booking_date: input.booking_date,
        start_time: input.start_time,
        end_time: input.end_time,
        status: BookingStatus::Pending,
        rejection_reason: None,
        rejection_remarks: None,
        cancellation_reason: None,
        requested_on: now,
        confirmed_on: None,
        confirmed_by: None,
        rejected_on: None,
        rejected_by: None,
        cancelled_on: None,
        cancelled_by: None,
        is_recurring: input.is_recurring,
        parent_booking_id: None,
        recurrence,
        occurrence_date: if input.is_recurring {
            Some(input.booking_date)
        } else {
            None
        },
        recurrence_sequence: if input.is_recurring { Some(1) } else { None },
    }
}

pub fn confirm(booking: &mut AmenityBooking, actor: Uuid, now: DateTime<Utc>) -> AppResult<()> {
    if booking.status != BookingStatus::Pending {
        return Err(AppError::InvalidStatus(format!(
            "cannot confirm a {:?} booking",
            booking.status
        )));
    }
    booking.status = BookingStatus::Confirmed;
    booking.confirmed_on = Some(now);
    booking.confirmed_by = Some(actor);
    Ok(())
}

pub fn reject(
    booking: &mut AmenityBooking,
    reason: Option<&str>,
    remarks: Option<&str>,
    actor: Uuid,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::MissingRequiredParam("rejection_reason".to_string()))?;
    if booking.status != BookingStatus::Pending {
        return Err(AppError::InvalidStatus(format!(
            "cannot reject a {:?} booking",
            booking.status
        )));
    }
    booking.status = BookingStatus::Rejected;
    booking.rejection_reason = Some(reason.to_string());
    booking.rejection_remarks = remarks.map(str::to_string);
    booking.rejected_on = Some(now);
    booking.rejected_by = Some(actor);
    Ok(())
}

/// Cancel a booking. Residents may only cancel their own; cancelling twice is a no-op.
pub fn cancel(
    booking: &mut AmenityBooking,
    reason: Option<&str>,
    ctx: &RequestContext,
    now: DateTime<Utc>,
) -> AppResult<CancelOutcome> {
    if ctx.is_resident() && ctx.resident_id != Some(booking.resident_id) {
        return Err(AppError::PermissionDenied(
            "residents may only cancel their own bookings".to_string(),
        ));
    }
    match booking.status {
        BookingStatus::Cancelled => Ok(CancelOutcome {
            changed: false,
            was_confirmed: false,
        }),
        BookingStatus::Pending | BookingStatus::Confirmed => {
            let was_confirmed = booking.status == BookingStatus::Confirmed;
            booking.status = BookingStatus::Cancelled;
            booking.cancellation_reason = reason.map(str::to_string);
            booking.cancelled_on = Some(now);
            booking.cancelled_by = Some(ctx.user_id);
            Ok(CancelOutcome {
                changed: true,
                was_confirmed,
            })
        }
        BookingStatus::Rejected => Err(AppError::InvalidStatusForCancellation(
            "a rejected booking cannot be cancelled".to_string(),
        )),
    }
}

/// Clone onto a new PENDING row at a new date/window. Recurrence is not carried over.
pub fn duplicate(
    source: &AmenityBooking,
    ctx: &RequestContext,
    booking_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    now: DateTime<Utc>,
) -> AppResult<AmenityBooking> {
    validate_window(start_time, end_time)?;
    Ok(AmenityBooking {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        booking_date,
        start_time,
        end_time,
        status: BookingStatus::Pending,
        rejection_reason: None,
        rejection_remarks: None,
        cancellation_reason: None,
        requested_on: now,
        confirmed_on: None,
        confirmed_by: None,
        rejected_on: None,
        rejected_by: None,
        cancelled_on: None,
        cancelled_by: None,
        is_recurring: false,
        parent_booking_id: None,
        recurrence: RecurrenceRule::default(),
        occurrence_date: None,
        recurrence_sequence: None,
        ..source.clone()
    })
}

/// Child row for one expanded occurrence of `parent`.
pub fn occurrence_child(
    parent: &AmenityBooking,
    occurrence: &Occurrence,
    ctx: &RequestContext,
    now: DateTime<Utc>,
) -> AmenityBooking {
    let cancelled = occurrence.status == BookingStatus::Cancelled;
    AmenityBooking {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        booking_date: occurrence.booking_date,
        start_time: occurrence.start_time,
        end_time: occurrence.end_time,
        status: occurrence.status,
        rejection_reason: None,
        rejection_remarks: None,
        cancellation_reason: None,
        requested_on: now,
        confirmed_on: None,
        confirmed_by: None,
        rejected_on: None,
        rejected_by: None,
        cancelled_on: cancelled.then_some(now),
        cancelled_by: cancelled.then_some(ctx.user_id),
        is_recurring: false,
        parent_booking_id: Some(parent.id()),
        recurrence: RecurrenceRule::default(),
        occurrence_date: Some(occurrence.occurrence_date),
        recurrence_sequence: Some(occurrence.sequence),
        slot_id: None,
        selected_slot_ids: Vec::new(),
        ..parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, UserType};

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn booking(ctx: &RequestContext) -> AmenityBooking {
        let input = NewBooking {
            amenity_id: Uuid::new_v4(),
            resident_id: Uuid::new_v4(),
            booking_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            start_time: t(10),
            end_time: t(11),
            selected_slot_ids: vec![],
            is_recurring: false,
            recurrence: RecurrenceRule::default(),
        };
        new_booking(ctx, &input, Utc::now())
    }

    fn slot(ctx: &RequestContext, max: i32) -> AmenitySlot {
        AmenitySlot {
            audit: AuditEnvelope::stamp_create(ctx),
            amenity_id: Uuid::new_v4(),
            slot_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            slot_start_time: t(10),
            slot_end_time: t(11),
            slot_duration_minutes: 60,
            is_available: true,
            total_bookings: 0,
            max_concurrent_bookings: max,
        }
    }

    #[test]
    fn confirm_only_from_pending() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut b = booking(&ctx);
        confirm(&mut b, ctx.user_id, Utc::now()).unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert!(matches!(
            confirm(&mut b, ctx.user_id, Utc::now()),
            Err(AppError::InvalidStatus(_))
        ));
    }

    #[test]
    fn capacity_is_strict() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let s = slot(&ctx, 1);
        assert!(ensure_capacity(&s, 0).is_ok());
        assert!(matches!(
            ensure_capacity(&s, 1),
            Err(AppError::InvalidStatus(_))
        ));
    }

    #[test]
    fn reject_requires_reason() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut b = booking(&ctx);
        assert!(matches!(
            reject(&mut b, Some("  "), None, ctx.user_id, Utc::now()),
            Err(AppError::MissingRequiredParam(_))
        ));
        reject(&mut b, Some("maintenance"), Some("pool closed"), ctx.user_id, Utc::now()).unwrap();
        assert_eq!(b.status, BookingStatus::Rejected);
    }

    #[test]
    fn cancel_is_idempotent_and_confirm_after_cancel_fails() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut b = booking(&ctx);
        confirm(&mut b, ctx.user_id, Utc::now()).unwrap();

        let first = cancel(&mut b, Some("changed plans"), &ctx, Utc::now()).unwrap();
        assert!(first.changed && first.was_confirmed);
        let second = cancel(&mut b, None, &ctx, Utc::now()).unwrap();
        assert!(!second.changed);
        assert!(confirm(&mut b, ctx.user_id, Utc::now()).is_err());
        assert_eq!(b.status, BookingStatus::Cancelled);
    }

    #[test]
    fn resident_cannot_cancel_foreign_booking() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut b = booking(&ctx);
        let resident_ctx = RequestContext {
            user_type: UserType::Resident,
            access_level: AccessLevel::Unit,
            resident_id: Some(Uuid::new_v4()),
            ..ctx.clone()
        };
        assert!(matches!(
            cancel(&mut b, None, &resident_ctx, Utc::now()),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[test]
    fn duplicate_keeps_fields_and_resets_status() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut b = booking(&ctx);
        confirm(&mut b, ctx.user_id, Utc::now()).unwrap();
        let new_date = NaiveDate::from_ymd_opt(2025, 1, 17).unwrap();

        let copy = duplicate(&b, &ctx, new_date, t(12), t(13), Utc::now()).unwrap();

        assert_eq!(copy.status, BookingStatus::Pending);
        assert_eq!(copy.amenity_id, b.amenity_id);
        assert_eq!(copy.resident_id, b.resident_id);
        assert_eq!(copy.booking_date, new_date);
        assert_ne!(copy.id(), b.id());
        assert!(copy.confirmed_on.is_none());
        assert!(!copy.is_recurring);
    }
}
