use keystone_core::models::{
    AmenityBlackoutPeriod, AuditEnvelope, BookingStatus, ExceptionType, NewBooking,
    RecurrenceEndType, RecurrenceRule, RepeatFrequency, SlotGenerationRequest,
};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
use keystone_services::{DuplicateBooking, NewException, RejectBooking};
use uuid::Uuid;

struct Seeded {
    services: TestServices,
    ctx: RequestContext,
    amenity_id: Uuid,
    resident_id: Uuid,
}

fn seed() -> Seeded {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let staff_user = create_test_user(tenant.id, "desk@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "bob@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let amenity = create_test_amenity(tenant.id, None);

    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let (amenity_id, resident_id) = (amenity.audit.id, resident.audit.id);
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
        s.amenities.insert(amenity.audit.id, amenity);
    });
    Seeded {
        services,
        ctx,
        amenity_id,
        resident_id,
    }
}

fn booking_on(seeded: &Seeded, day: &str, start: &str, end: &str) -> NewBooking {
    NewBooking {
        amenity_id: seeded.amenity_id,
        resident_id: seeded.resident_id,
        booking_date: date(day),
        start_time: time(start),
        end_time: time(end),
        selected_slot_ids: Vec::new(),
        is_recurring: false,
        recurrence: RecurrenceRule::default(),
    }
}

fn weekly_mondays(seeded: &Seeded, occurrences: i32) -> NewBooking {
    NewBooking {
        is_recurring: true,
        recurrence: RecurrenceRule {
            repeat_frequency: RepeatFrequency::Weekly,
            repeat_interval: 1,
            repeat_on_days_of_week: vec![1],
            repeat_on_day_of_month: None,
            recurrence_end_type: RecurrenceEndType::AfterOccurrences,
            recurrence_end_date: None,
            recurrence_occurrences: Some(occurrences),
        },
        ..booking_on(seeded, "2025-01-06", "10:00", "11:00")
    }
}

#[tokio::test]
async fn test_generate_slots_reports_counts() {
    let seeded = seed();
    let request = SlotGenerationRequest {
        amenity_id: seeded.amenity_id,
        from_date: date("2025-01-10"),
        to_date: date("2025-01-11"),
        operating_start_time: time("09:00"),
        operating_end_time: time("12:00"),
        interval_minutes: 60,
        max_concurrent_bookings: 2,
        delete_existing: false,
    };
    let report = seeded
        .services
        .reservations
        .generate_slots(&seeded.ctx, &request)
        .await
        .unwrap();
    assert_eq!(report.created_count, 6);
    assert_eq!(report.updated_due_to_blackout, 0);
    assert_eq!(report.error_count, 0);

    let again = seeded
        .services
        .reservations
        .generate_slots(&seeded.ctx, &request)
        .await
        .unwrap();
    assert_eq!(again.created_count, 0);

    let slots = seeded
        .services
        .reservations
        .list_slots(&seeded.ctx, seeded.amenity_id, date("2025-01-10"), date("2025-01-10"))
        .await
        .unwrap();
    assert_eq!(slots.len(), 3);
}

#[tokio::test]
async fn test_generate_slots_counts_blackout_updates() {
    let seeded = seed();
    let blackout = AmenityBlackoutPeriod {
        audit: AuditEnvelope::stamp_create(&seeded.ctx),
        amenity_id: seeded.amenity_id,
        start_date: date("2025-01-10"),
        end_date: date("2025-01-10"),
        start_time: Some(time("10:00")),
        end_time: Some(time("12:00")),
        reason: "pool resurfacing".to_string(),
    };
    seeded.services.store.with_state(|s| s.blackouts.push(blackout));

    let report = seeded
        .services
        .reservations
        .generate_slots(
            &seeded.ctx,
            &SlotGenerationRequest {
                amenity_id: seeded.amenity_id,
                from_date: date("2025-01-10"),
                to_date: date("2025-01-11"),
                operating_start_time: time("09:00"),
                operating_end_time: time("12:00"),
                interval_minutes: 60,
                max_concurrent_bookings: 2,
                delete_existing: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.created_count, 6);
    assert_eq!(report.updated_due_to_blackout, 2);
    assert!(report.summary.contains("2 blocked by blackout"));

    let slots = seeded
        .services
        .reservations
        .list_slots(&seeded.ctx, seeded.amenity_id, date("2025-01-10"), date("2025-01-10"))
        .await
        .unwrap();
    let open: Vec<_> = slots.iter().filter(|s| s.is_available).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].slot_start_time, time("09:00"));
}

#[tokio::test]
async fn test_concurrent_confirms_respect_slot_capacity() {
    let seeded = seed();
    let slot = create_test_slot(
        seeded.ctx.tenant_id,
        seeded.amenity_id,
        date("2025-01-10"),
        time("10:00"),
        time("11:00"),
        1,
    );
    let slot_id = slot.audit.id;
    seeded.services.store.with_state(|s| {
        s.slots.insert(slot.audit.id, slot);
    });

    let reservations = &seeded.services.reservations;
    let first = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await
        .unwrap();
    let second = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await
        .unwrap();
    assert_eq!(first.status, BookingStatus::Pending);
    assert_eq!(second.status, BookingStatus::Pending);

    let (a, b) = tokio::join!(
        reservations.confirm(&seeded.ctx, first.audit.id),
        reservations.confirm(&seeded.ctx, second.audit.id),
    );
    let outcomes = [a, b];
    let confirmed = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(confirmed, 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(AppError::InvalidStatus(_)))));

    let slot = seeded
        .services
        .store
        .with_state(|s| s.slots.get(&slot_id).cloned().unwrap());
    assert_eq!(slot.total_bookings, 1);
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_releases_capacity() {
    let seeded = seed();
    let slot = create_test_slot(
        seeded.ctx.tenant_id,
        seeded.amenity_id,
        date("2025-01-10"),
        time("10:00"),
        time("11:00"),
        1,
    );
    let slot_id = slot.audit.id;
    seeded.services.store.with_state(|s| {
        s.slots.insert(slot.audit.id, slot);
    });
    let reservations = &seeded.services.reservations;
    let booking = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await
        .unwrap();
    reservations.confirm(&seeded.ctx, booking.audit.id).await.unwrap();

    let cancelled = reservations
        .cancel(&seeded.ctx, booking.audit.id, Some("plans changed"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let again = reservations
        .cancel(&seeded.ctx, booking.audit.id, Some("plans changed"))
        .await
        .unwrap();
    assert_eq!(again.status, BookingStatus::Cancelled);
    assert_eq!(again.audit.version, cancelled.audit.version);

    let slot = seeded
        .services
        .store
        .with_state(|s| s.slots.get(&slot_id).cloned().unwrap());
    assert_eq!(slot.total_bookings, 0);

    // The freed slot takes a new booking.
    let next = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await
        .unwrap();
    reservations.confirm(&seeded.ctx, next.audit.id).await.unwrap();
}

#[tokio::test]
async fn test_rejected_booking_cannot_be_cancelled() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let booking = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-12", "15:00", "16:00"))
        .await
        .unwrap();
    let rejected = reservations
        .reject(
            &seeded.ctx,
            booking.audit.id,
            &RejectBooking {
                rejection_reason: Some("maintenance".to_string()),
                rejection_remarks: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);

    let result = reservations.cancel(&seeded.ctx, booking.audit.id, None).await;
    assert!(matches!(
        result,
        Err(AppError::InvalidStatusForCancellation(_))
    ));
}

#[tokio::test]
async fn test_booking_window_must_be_ordered() {
    let seeded = seed();
    let result = seeded
        .services
        .reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "11:00", "10:00"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_resident_cannot_book_for_someone_else() {
    let seeded = seed();
    let own_user = Uuid::new_v4();
    let ctx = resident_context(seeded.ctx.tenant_id, own_user, Uuid::new_v4());
    let result = seeded
        .services
        .reservations
        .create_booking(&ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await;
    assert!(matches!(result, Err(AppError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_weekly_series_with_modify_and_skip() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let parent = reservations
        .create_booking(&seeded.ctx, &weekly_mondays(&seeded, 4))
        .await
        .unwrap();
    let horizon = Some(date("2025-03-31"));

    let series = reservations
        .occurrences(&seeded.ctx, parent.audit.id, horizon)
        .await
        .unwrap();
    let dates: Vec<_> = series.iter().map(|o| o.booking_date).collect();
    assert_eq!(
        dates,
        vec![
            date("2025-01-06"),
            date("2025-01-13"),
            date("2025-01-20"),
            date("2025-01-27")
        ]
    );

    reservations
        .add_exception(
            &seeded.ctx,
            parent.audit.id,
            &NewException {
                occurrence_date: date("2025-01-13"),
                exception_type: ExceptionType::Modify,
                new_booking_date: None,
                new_start_time: Some(time("11:00")),
                new_end_time: Some(time("12:00")),
            },
        )
        .await
        .unwrap();
    let series = reservations
        .occurrences(&seeded.ctx, parent.audit.id, horizon)
        .await
        .unwrap();
    assert_eq!(series.len(), 4);
    let moved = series
        .iter()
        .find(|o| o.occurrence_date == date("2025-01-13"))
        .unwrap();
    assert_eq!(moved.start_time, time("11:00"));
    assert_eq!(moved.end_time, time("12:00"));

    reservations
        .add_exception(
            &seeded.ctx,
            parent.audit.id,
            &NewException {
                occurrence_date: date("2025-01-20"),
                exception_type: ExceptionType::Skip,
                new_booking_date: None,
                new_start_time: None,
                new_end_time: None,
            },
        )
        .await
        .unwrap();
    let series = reservations
        .occurrences(&seeded.ctx, parent.audit.id, horizon)
        .await
        .unwrap();
    assert_eq!(series.len(), 3);
    assert!(series
        .iter()
        .all(|o| o.occurrence_date != date("2025-01-20")));
}

#[tokio::test]
async fn test_exception_on_first_occurrence_is_rejected() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let parent = reservations
        .create_booking(&seeded.ctx, &weekly_mondays(&seeded, 4))
        .await
        .unwrap();
    let result = reservations
        .add_exception(
            &seeded.ctx,
            parent.audit.id,
            &NewException {
                occurrence_date: date("2025-01-06"),
                exception_type: ExceptionType::Skip,
                new_booking_date: None,
                new_start_time: None,
                new_end_time: None,
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
}

#[tokio::test]
async fn test_series_children_are_materialized_once() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let parent = reservations
        .create_booking(&seeded.ctx, &weekly_mondays(&seeded, 4))
        .await
        .unwrap();

    let children = seeded.services.store.with_state(|s| {
        s.bookings
            .values()
            .filter(|b| b.parent_booking_id == Some(parent.audit.id))
            .count()
    });
    assert_eq!(children, 3);

    let inserted = reservations
        .materialize(&seeded.ctx, parent.audit.id, None)
        .await
        .unwrap();
    assert_eq!(inserted, 0);
}

#[tokio::test]
async fn test_duplicate_copies_booking_to_new_date() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let source = reservations
        .create_booking(&seeded.ctx, &booking_on(&seeded, "2025-01-10", "10:00", "11:00"))
        .await
        .unwrap();
    let copy = reservations
        .duplicate(
            &seeded.ctx,
            source.audit.id,
            &DuplicateBooking {
                booking_date: date("2025-01-17"),
                start_time: time("10:00"),
                end_time: time("11:00"),
            },
        )
        .await
        .unwrap();
    assert_ne!(copy.audit.id, source.audit.id);
    assert_eq!(copy.booking_date, date("2025-01-17"));
    assert_eq!(copy.status, BookingStatus::Pending);
    assert!(copy.selected_slot_ids.is_empty());
}

#[tokio::test]
async fn test_cancel_exception_on_confirmed_occurrence_releases_capacity() {
    let seeded = seed();
    let slot = create_test_slot(
        seeded.ctx.tenant_id,
        seeded.amenity_id,
        date("2025-01-13"),
        time("10:00"),
        time("11:00"),
        1,
    );
    let slot_id = slot.audit.id;
    seeded.services.store.with_state(|s| {
        s.slots.insert(slot.audit.id, slot);
    });
    let reservations = &seeded.services.reservations;
    let parent = reservations
        .create_booking(&seeded.ctx, &weekly_mondays(&seeded, 4))
        .await
        .unwrap();
    let child_id = seeded.services.store.with_state(|s| {
        s.bookings
            .values()
            .find(|b| {
                b.parent_booking_id == Some(parent.audit.id)
                    && b.occurrence_date == Some(date("2025-01-13"))
            })
            .map(|b| b.audit.id)
            .unwrap()
    });
    reservations.confirm(&seeded.ctx, child_id).await.unwrap();
    let held = seeded
        .services
        .store
        .with_state(|s| s.slots.get(&slot_id).cloned().unwrap());
    assert_eq!(held.total_bookings, 1);

    let exception = reservations
        .add_exception(
            &seeded.ctx,
            parent.audit.id,
            &NewException {
                occurrence_date: date("2025-01-13"),
                exception_type: ExceptionType::Cancel,
                new_booking_date: None,
                new_start_time: None,
                new_end_time: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(exception.exception_type, ExceptionType::Cancel);

    let (child, slot, recorded) = seeded.services.store.with_state(|s| {
        (
            s.bookings.get(&child_id).cloned().unwrap(),
            s.slots.get(&slot_id).cloned().unwrap(),
            s.exceptions
                .values()
                .filter(|e| e.parent_booking_id == parent.audit.id)
                .count(),
        )
    });
    assert_eq!(child.status, BookingStatus::Cancelled);
    assert_eq!(slot.total_bookings, 0);
    assert_eq!(recorded, 1);
}

#[tokio::test]
async fn test_confirmed_occurrence_cannot_be_skipped() {
    let seeded = seed();
    let reservations = &seeded.services.reservations;
    let parent = reservations
        .create_booking(&seeded.ctx, &weekly_mondays(&seeded, 4))
        .await
        .unwrap();
    let child_id = seeded.services.store.with_state(|s| {
        s.bookings
            .values()
            .find(|b| b.occurrence_date == Some(date("2025-01-20")))
            .map(|b| b.audit.id)
            .unwrap()
    });
    reservations.confirm(&seeded.ctx, child_id).await.unwrap();

    let result = reservations
        .add_exception(
            &seeded.ctx,
            parent.audit.id,
            &NewException {
                occurrence_date: date("2025-01-20"),
                exception_type: ExceptionType::Skip,
                new_booking_date: None,
                new_start_time: None,
                new_end_time: None,
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidStatus(_))));
    let exceptions = seeded.services.store.with_state(|s| s.exceptions.len());
    assert_eq!(exceptions, 0);
}
