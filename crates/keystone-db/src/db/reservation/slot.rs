//! Slot and blackout queries shared by the reservation repository.

use chrono::{NaiveDate, NaiveTime};
use keystone_core::models::{AmenityBlackoutPeriod, AmenitySlot};
use keystone_core::AppResult;
use sqlx::{PgExecutor, Postgres};
use uuid::Uuid;

use crate::db::db_error;

/// Returns true when a new row was inserted. Refreshing an existing slot never drops its
/// capacity below the bookings it already holds.
pub(super) async fn upsert_slot<'e, E: PgExecutor<'e>>(
    executor: E,
    slot: &AmenitySlot,
) -> AppResult<bool> {
    let (created,) = sqlx::query_as::<Postgres, (bool,)>(
        r#"
        INSERT INTO amenity_slots (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            amenity_id, slot_date, slot_start_time, slot_end_time, slot_duration_minutes,
            is_available, total_bookings, max_concurrent_bookings
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (amenity_id, slot_date, slot_start_time) WHERE deleted_by IS NULL
        DO UPDATE SET
            slot_end_time = EXCLUDED.slot_end_time,
            slot_duration_minutes = EXCLUDED.slot_duration_minutes,
            is_available = EXCLUDED.is_available,
            max_concurrent_bookings =
                GREATEST(EXCLUDED.max_concurrent_bookings, amenity_slots.total_bookings),
            updated_on = EXCLUDED.updated_on,
            updated_by = EXCLUDED.updated_by,
            version = amenity_slots.version + 1
        RETURNING (xmax = 0)
        "#,
    )
    .bind(slot.audit.id)
    .bind(slot.audit.version)
    .bind(slot.audit.tenant_id)
    .bind(slot.audit.created_on)
    .bind(slot.audit.updated_on)
    .bind(slot.audit.created_by)
    .bind(slot.audit.updated_by)
    .bind(slot.amenity_id)
    .bind(slot.slot_date)
    .bind(slot.slot_start_time)
    .bind(slot.slot_end_time)
    .bind(slot.slot_duration_minutes)
    .bind(slot.is_available)
    .bind(slot.total_bookings)
    .bind(slot.max_concurrent_bookings)
    .fetch_one(executor)
    .await
    .map_err(db_error("Failed to upsert amenity slot"))?;

    Ok(created)
}

/// Slots a booking occupies, locked in id order. Explicit selections win; otherwise every
/// slot of the amenity intersecting the booking window.
pub(super) async fn lock_slots_for_booking<'e, E: PgExecutor<'e>>(
    executor: E,
    tenant_id: Uuid,
    amenity_id: Uuid,
    slot_ids: &[Uuid],
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> AppResult<Vec<AmenitySlot>> {
    let slots = if slot_ids.is_empty() {
        sqlx::query_as::<Postgres, AmenitySlot>(
            r#"
            SELECT * FROM amenity_slots
            WHERE tenant_id = $1 AND amenity_id = $2 AND slot_date = $3
              AND slot_start_time < $5 AND $4 < slot_end_time
              AND deleted_by IS NULL
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(amenity_id)
        .bind(date)
        .bind(start)
        .bind(end)
        .fetch_all(executor)
        .await
    } else {
        sqlx::query_as::<Postgres, AmenitySlot>(
            r#"
            SELECT * FROM amenity_slots
            WHERE tenant_id = $1 AND id = ANY($2) AND deleted_by IS NULL
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(slot_ids)
        .fetch_all(executor)
        .await
    };

    slots.map_err(db_error("Failed to lock amenity slots"))
}

/// CONFIRMED bookings other than `exclude` overlapping the slot window.
pub(super) async fn count_confirmed_overlapping<'e, E: PgExecutor<'e>>(
    executor: E,
    slot: &AmenitySlot,
    exclude: Uuid,
) -> AppResult<i64> {
    let (count,) = sqlx::query_as::<Postgres, (i64,)>(
        r#"
        SELECT COUNT(*) FROM amenity_bookings
        WHERE tenant_id = $1 AND amenity_id = $2 AND booking_date = $3
          AND start_time < $5 AND $4 < end_time
          AND status = 'CONFIRMED' AND id <> $6 AND deleted_by IS NULL
        "#,
    )
    .bind(slot.audit.tenant_id)
    .bind(slot.amenity_id)
    .bind(slot.slot_date)
    .bind(slot.slot_start_time)
    .bind(slot.slot_end_time)
    .bind(exclude)
    .fetch_one(executor)
    .await
    .map_err(db_error("Failed to count confirmed bookings"))?;

    Ok(count)
}

pub(super) async fn adjust_slot_bookings<'e, E: PgExecutor<'e>>(
    executor: E,
    tenant_id: Uuid,
    slot_ids: &[Uuid],
    delta: i32,
    actor: Uuid,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE amenity_slots
        SET total_bookings = LEAST(GREATEST(total_bookings + $3, 0), max_concurrent_bookings),
            updated_on = NOW(), updated_by = $4, version = version + 1
        WHERE tenant_id = $1 AND id = ANY($2)
        "#,
    )
    .bind(tenant_id)
    .bind(slot_ids)
    .bind(delta)
    .bind(actor)
    .execute(executor)
    .await
    .map_err(db_error("Failed to adjust slot bookings"))?;

    Ok(())
}

pub(super) async fn list_blackouts<'e, E: PgExecutor<'e>>(
    executor: E,
    tenant_id: Uuid,
    amenity_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<Vec<AmenityBlackoutPeriod>> {
    let blackouts = sqlx::query_as::<Postgres, AmenityBlackoutPeriod>(
        r#"
        SELECT * FROM amenity_blackout_periods
        WHERE tenant_id = $1 AND amenity_id = $2
          AND start_date <= $4 AND end_date >= $3
          AND deleted_by IS NULL
        ORDER BY start_date
        "#,
    )
    .bind(tenant_id)
    .bind(amenity_id)
    .bind(from)
    .bind(to)
    .fetch_all(executor)
    .await
    .map_err(db_error("Failed to list blackout periods"))?;

    Ok(blackouts)
}
