use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use keystone_core::models::{
    Amenity, AmenityBlackoutPeriod, AmenityBooking, AmenitySlot, RecurrenceException,
};
use keystone_core::reservation::{booking, CancelOutcome};
use keystone_core::{AppError, AppResult, RequestContext};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::slot;
use crate::db::scope::scoped_select;
use crate::db::transaction::{begin_serializable, commit, retry_on_contention};
use crate::db::db_error;
use crate::store_traits::ReservationStore;

const INSERT_BOOKING: &str = r#"
    INSERT INTO amenity_bookings (
        id, version, tenant_id, created_on, updated_on, created_by, updated_by,
        amenity_id, resident_id, slot_id, selected_slot_ids, booking_date, start_time, end_time,
        status, rejection_reason, rejection_remarks, cancellation_reason, requested_on,
        confirmed_on, confirmed_by, rejected_on, rejected_by, cancelled_on, cancelled_by,
        is_recurring, parent_booking_id, repeat_frequency, repeat_interval,
        repeat_on_days_of_week, repeat_on_day_of_month, recurrence_end_type,
        recurrence_end_date, recurrence_occurrences, occurrence_date, recurrence_sequence
    ) "#;

#[derive(Clone)]
pub struct PgReservationRepository {
    pool: PgPool,
}

impl PgReservationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn confirm_booking_once(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<AmenityBooking> {
        let mut tx = begin_serializable(&self.pool).await?;

        let mut pending = sqlx::query_as::<Postgres, AmenityBooking>(
            r#"
            SELECT * FROM amenity_bookings
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock booking"))?
        .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;

        booking::confirm(&mut pending, actor, now)?;

        let slots = slot::lock_slots_for_booking(
            &mut *tx,
            tenant_id,
            pending.amenity_id,
            &pending.occupied_slot_ids(),
            pending.booking_date,
            pending.start_time,
            pending.end_time,
        )
        .await?;

        for locked in &slots {
            let confirmed = slot::count_confirmed_overlapping(&mut *tx, locked, booking_id).await?;
            booking::ensure_capacity(locked, confirmed)?;
        }

        let slot_ids: Vec<Uuid> = slots.iter().map(AmenitySlot::id).collect();
        if !slot_ids.is_empty() {
            slot::adjust_slot_bookings(&mut *tx, tenant_id, &slot_ids, 1, actor).await?;
        }

        pending.audit.version += 1;
        pending.audit.updated_on = now;
        pending.audit.updated_by = Some(actor);
        let confirmed = write_booking(&mut *tx, &pending).await?;

        commit(tx).await?;
        Ok(confirmed)
    }

    async fn cancel_booking_once(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(AmenityBooking, CancelOutcome)> {
        let mut tx = begin_serializable(&self.pool).await?;
        let cancelled = cancel_locked(&mut tx, ctx, booking_id, reason, now).await?;
        commit(tx).await?;
        Ok(cancelled)
    }

    async fn cancel_occurrence_once(
        &self,
        ctx: &RequestContext,
        exception: &RecurrenceException,
        child_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(RecurrenceException, AmenityBooking, CancelOutcome)> {
        let mut tx = begin_serializable(&self.pool).await?;
        let saved = upsert_exception(&mut *tx, exception).await?;
        let (cancelled, outcome) = cancel_locked(&mut tx, ctx, child_id, reason, now).await?;
        commit(tx).await?;
        Ok((saved, cancelled, outcome))
    }
}

/// Cancel a booking under a row lock, releasing slot capacity when it was confirmed.
async fn cancel_locked(
    conn: &mut PgConnection,
    ctx: &RequestContext,
    booking_id: Uuid,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> AppResult<(AmenityBooking, CancelOutcome)> {
    let mut qb = scoped_select::<AmenityBooking>(ctx);
    qb.push(" AND amenity_bookings.id = ");
    qb.push_bind(booking_id);
    qb.push(" FOR UPDATE OF amenity_bookings");
    let mut current = qb
        .build_query_as::<AmenityBooking>()
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to lock booking"))?
        .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;

    let outcome = booking::cancel(&mut current, reason, ctx, now)?;
    if !outcome.changed {
        return Ok((current, outcome));
    }

    current.audit.stamp_update(ctx);
    let cancelled = write_booking(&mut *conn, &current).await?;

    if outcome.was_confirmed {
        let slots = slot::lock_slots_for_booking(
            &mut *conn,
            ctx.tenant_id,
            cancelled.amenity_id,
            &cancelled.occupied_slot_ids(),
            cancelled.booking_date,
            cancelled.start_time,
            cancelled.end_time,
        )
        .await?;
        let slot_ids: Vec<Uuid> = slots.iter().map(AmenitySlot::id).collect();
        if !slot_ids.is_empty() {
            slot::adjust_slot_bookings(&mut *conn, ctx.tenant_id, &slot_ids, -1, ctx.user_id).await?;
        }
    }

    Ok((cancelled, outcome))
}

/// Insert or revive the exception keyed by (parent, occurrence_date).
async fn upsert_exception<'e, E: PgExecutor<'e>>(
    executor: E,
    exception: &RecurrenceException,
) -> AppResult<RecurrenceException> {
    sqlx::query_as::<Postgres, RecurrenceException>(
        r#"
        INSERT INTO recurrence_exceptions (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            parent_booking_id, occurrence_date, exception_type,
            new_start_time, new_end_time, new_booking_date
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (parent_booking_id, occurrence_date) DO UPDATE
        SET exception_type = EXCLUDED.exception_type,
            new_start_time = EXCLUDED.new_start_time,
            new_end_time = EXCLUDED.new_end_time,
            new_booking_date = EXCLUDED.new_booking_date,
            deleted_by = NULL,
            updated_on = EXCLUDED.updated_on,
            updated_by = EXCLUDED.updated_by,
            version = recurrence_exceptions.version + 1
        RETURNING *
        "#,
    )
    .bind(exception.audit.id)
    .bind(exception.audit.version)
    .bind(exception.audit.tenant_id)
    .bind(exception.audit.created_on)
    .bind(exception.audit.updated_on)
    .bind(exception.audit.created_by)
    .bind(exception.audit.updated_by)
    .bind(exception.parent_booking_id)
    .bind(exception.occurrence_date)
    .bind(exception.exception_type)
    .bind(exception.new_start_time)
    .bind(exception.new_end_time)
    .bind(exception.new_booking_date)
    .fetch_one(executor)
    .await
    .map_err(db_error("Failed to save recurrence exception"))
}

fn push_booking_values(qb: &mut QueryBuilder<'_, Postgres>, bookings: &[AmenityBooking]) {
    qb.push_values(bookings, |mut row, b| {
        row.push_bind(b.audit.id)
            .push_bind(b.audit.version)
            .push_bind(b.audit.tenant_id)
            .push_bind(b.audit.created_on)
            .push_bind(b.audit.updated_on)
            .push_bind(b.audit.created_by)
            .push_bind(b.audit.updated_by)
            .push_bind(b.amenity_id)
            .push_bind(b.resident_id)
            .push_bind(b.slot_id)
            .push_bind(b.selected_slot_ids.clone())
            .push_bind(b.booking_date)
            .push_bind(b.start_time)
            .push_bind(b.end_time)
            .push_bind(b.status)
            .push_bind(b.rejection_reason.clone())
            .push_bind(b.rejection_remarks.clone())
            .push_bind(b.cancellation_reason.clone())
            .push_bind(b.requested_on)
            .push_bind(b.confirmed_on)
            .push_bind(b.confirmed_by)
            .push_bind(b.rejected_on)
            .push_bind(b.rejected_by)
            .push_bind(b.cancelled_on)
            .push_bind(b.cancelled_by)
            .push_bind(b.is_recurring)
            .push_bind(b.parent_booking_id)
            .push_bind(b.recurrence.repeat_frequency)
            .push_bind(b.recurrence.repeat_interval)
            .push_bind(b.recurrence.repeat_on_days_of_week.clone())
            .push_bind(b.recurrence.repeat_on_day_of_month)
            .push_bind(b.recurrence.recurrence_end_type)
            .push_bind(b.recurrence.recurrence_end_date)
            .push_bind(b.recurrence.recurrence_occurrences)
            .push_bind(b.occurrence_date)
            .push_bind(b.recurrence_sequence);
    });
}

/// Optimistic write of a booking whose envelope was already bumped.
async fn write_booking<'e, E: PgExecutor<'e>>(
    executor: E,
    b: &AmenityBooking,
) -> AppResult<AmenityBooking> {
    let updated = sqlx::query_as::<Postgres, AmenityBooking>(
        r#"
        UPDATE amenity_bookings
        SET booking_date = $3, start_time = $4, end_time = $5, status = $6,
            rejection_reason = $7, rejection_remarks = $8, cancellation_reason = $9,
            confirmed_on = $10, confirmed_by = $11, rejected_on = $12, rejected_by = $13,
            cancelled_on = $14, cancelled_by = $15, slot_id = $16, selected_slot_ids = $17,
            version = $18, updated_on = $19, updated_by = $20, deleted_by = $21
        WHERE tenant_id = $1 AND id = $2 AND version = $18 - 1
        RETURNING *
        "#,
    )
    .bind(b.audit.tenant_id)
    .bind(b.audit.id)
    .bind(b.booking_date)
    .bind(b.start_time)
    .bind(b.end_time)
    .bind(b.status)
    .bind(&b.rejection_reason)
    .bind(&b.rejection_remarks)
    .bind(&b.cancellation_reason)
    .bind(b.confirmed_on)
    .bind(b.confirmed_by)
    .bind(b.rejected_on)
    .bind(b.rejected_by)
    .bind(b.cancelled_on)
    .bind(b.cancelled_by)
    .bind(b.slot_id)
    .bind(&b.selected_slot_ids)
    .bind(b.audit.version)
    .bind(b.audit.updated_on)
    .bind(b.audit.updated_by)
    .bind(b.audit.deleted_by)
    .fetch_optional(executor)
    .await
    .map_err(db_error("Failed to update booking"))?;

    updated.ok_or_else(|| {
        AppError::Conflict("booking was modified concurrently or no longer exists".to_string())
    })
}

#[async_trait]
impl ReservationStore for PgReservationRepository {
    #[tracing::instrument(skip(self), fields(db.table = "amenities", db.operation = "select"))]
    async fn get_amenity(&self, tenant_id: Uuid, amenity_id: Uuid) -> AppResult<Option<Amenity>> {
        let amenity = sqlx::query_as::<Postgres, Amenity>(
            "SELECT * FROM amenities WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(amenity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get amenity"))?;

        Ok(amenity)
    }

    #[tracing::instrument(skip(self), fields(db.table = "amenity_slots", db.operation = "soft_delete"))]
    async fn delete_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        actor: Uuid,
    ) -> AppResult<u64> {
        // Slots still holding bookings survive regeneration.
        let result = sqlx::query(
            r#"
            UPDATE amenity_slots
            SET deleted_by = $5, updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND amenity_id = $2 AND slot_date BETWEEN $3 AND $4
              AND total_bookings = 0 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(amenity_id)
        .bind(from)
        .bind(to)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to delete amenity slots"))?;

        tracing::info!(
            amenity_id = %amenity_id,
            deleted = result.rows_affected(),
            "Existing slots removed before regeneration"
        );

        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self, slot), fields(db.table = "amenity_slots", db.operation = "upsert"))]
    async fn upsert_slot(&self, slot: &AmenitySlot) -> AppResult<bool> {
        slot::upsert_slot(&self.pool, slot).await
    }

    #[tracing::instrument(skip(self), fields(db.table = "amenity_slots", db.operation = "select"))]
    async fn list_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenitySlot>> {
        let slots = sqlx::query_as::<Postgres, AmenitySlot>(
            r#"
            SELECT * FROM amenity_slots
            WHERE tenant_id = $1 AND amenity_id = $2 AND slot_date BETWEEN $3 AND $4
              AND deleted_by IS NULL
            ORDER BY slot_date, slot_start_time
            "#,
        )
        .bind(tenant_id)
        .bind(amenity_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list amenity slots"))?;

        Ok(slots)
    }

    #[tracing::instrument(skip(self, slot_ids), fields(db.table = "amenity_slots", db.operation = "update"))]
    async fn mark_slots_unavailable(
        &self,
        tenant_id: Uuid,
        slot_ids: &[Uuid],
        actor: Uuid,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE amenity_slots
            SET is_available = FALSE, updated_on = NOW(), updated_by = $3, version = version + 1
            WHERE tenant_id = $1 AND id = ANY($2) AND is_available AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(slot_ids)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to apply blackout to slots"))?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self), fields(db.table = "amenity_blackout_periods", db.operation = "select"))]
    async fn list_blackouts(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenityBlackoutPeriod>> {
        slot::list_blackouts(&self.pool, tenant_id, amenity_id, from, to).await
    }

    #[tracing::instrument(skip(self, booking), fields(db.table = "amenity_bookings", db.operation = "insert"))]
    async fn insert_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking> {
        let mut qb = QueryBuilder::<Postgres>::new(INSERT_BOOKING);
        push_booking_values(&mut qb, std::slice::from_ref(booking));
        qb.push(" RETURNING *");

        let created = qb
            .build_query_as::<AmenityBooking>()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to create booking"))?;

        tracing::info!(
            booking_id = %created.id(),
            amenity_id = %created.amenity_id,
            recurring = created.is_recurring,
            "Booking requested"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, ctx), fields(db.table = "amenity_bookings", db.operation = "select"))]
    async fn get_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
    ) -> AppResult<Option<AmenityBooking>> {
        let mut qb = scoped_select::<AmenityBooking>(ctx);
        qb.push(" AND amenity_bookings.id = ");
        qb.push_bind(booking_id);

        let found = qb
            .build_query_as::<AmenityBooking>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get booking"))?;

        Ok(found)
    }

    #[tracing::instrument(skip(self, booking), fields(db.table = "amenity_bookings", db.operation = "update"))]
    async fn update_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking> {
        write_booking(&self.pool, booking).await
    }

    #[tracing::instrument(skip(self), fields(db.table = "amenity_bookings", db.operation = "confirm"))]
    async fn confirm_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<AmenityBooking> {
        let confirmed = retry_on_contention("confirm_booking", move || {
            self.confirm_booking_once(tenant_id, booking_id, actor, now)
        })
        .await?;

        tracing::info!(
            booking_id = %booking_id,
            tenant_id = %tenant_id,
            confirmed_by = %actor,
            "Booking confirmed"
        );

        Ok(confirmed)
    }

    #[tracing::instrument(skip(self, ctx, reason), fields(db.table = "amenity_bookings", db.operation = "cancel"))]
    async fn cancel_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(AmenityBooking, CancelOutcome)> {
        let (cancelled, outcome) = retry_on_contention("cancel_booking", move || {
            self.cancel_booking_once(ctx, booking_id, reason, now)
        })
        .await?;

        if outcome.changed {
            tracing::info!(
                booking_id = %booking_id,
                released_capacity = outcome.was_confirmed,
                "Booking cancelled"
            );
        }

        Ok((cancelled, outcome))
    }

    #[tracing::instrument(skip(self, ctx, exception, reason), fields(db.table = "recurrence_exceptions", db.operation = "cancel_occurrence"))]
    async fn cancel_occurrence(
        &self,
        ctx: &RequestContext,
        exception: &RecurrenceException,
        child_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(RecurrenceException, AmenityBooking, CancelOutcome)> {
        let (saved, cancelled, outcome) = retry_on_contention("cancel_occurrence", move || {
            self.cancel_occurrence_once(ctx, exception, child_id, reason, now)
        })
        .await?;

        tracing::info!(
            parent_booking_id = %saved.parent_booking_id,
            occurrence_date = %saved.occurrence_date,
            booking_id = %child_id,
            released_capacity = outcome.was_confirmed,
            "Occurrence cancelled"
        );

        Ok((saved, cancelled, outcome))
    }

    #[tracing::instrument(skip(self), fields(db.table = "recurrence_exceptions", db.operation = "select"))]
    async fn list_exceptions(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> AppResult<Vec<RecurrenceException>> {
        let exceptions = sqlx::query_as::<Postgres, RecurrenceException>(
            r#"
            SELECT * FROM recurrence_exceptions
            WHERE tenant_id = $1 AND parent_booking_id = $2 AND deleted_by IS NULL
            ORDER BY occurrence_date
            "#,
        )
        .bind(tenant_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list recurrence exceptions"))?;

        Ok(exceptions)
    }

    #[tracing::instrument(skip(self, exception, child), fields(db.table = "recurrence_exceptions", db.operation = "upsert"))]
    async fn apply_exception(
        &self,
        exception: &RecurrenceException,
        child: Option<&AmenityBooking>,
    ) -> AppResult<RecurrenceException> {
        let mut tx = begin_serializable(&self.pool).await?;

        let saved = upsert_exception(&mut *tx, exception).await?;

        if let Some(child) = child {
            write_booking(&mut *tx, child).await?;
        }

        commit(tx).await?;

        tracing::info!(
            parent_booking_id = %saved.parent_booking_id,
            occurrence_date = %saved.occurrence_date,
            exception_type = ?saved.exception_type,
            rewrote_child = child.is_some(),
            "Recurrence exception applied"
        );

        Ok(saved)
    }

    #[tracing::instrument(skip(self), fields(db.table = "amenity_bookings", db.operation = "select"))]
    async fn list_children(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> AppResult<Vec<AmenityBooking>> {
        let children = sqlx::query_as::<Postgres, AmenityBooking>(
            r#"
            SELECT * FROM amenity_bookings
            WHERE tenant_id = $1 AND parent_booking_id = $2 AND deleted_by IS NULL
            ORDER BY occurrence_date
            "#,
        )
        .bind(tenant_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list occurrence bookings"))?;

        Ok(children)
    }

    #[tracing::instrument(skip(self, children), fields(db.table = "amenity_bookings", db.operation = "insert", count = children.len()))]
    async fn insert_children(&self, children: &[AmenityBooking]) -> AppResult<usize> {
        if children.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(INSERT_BOOKING);
        push_booking_values(&mut qb, children);
        qb.push(
            " ON CONFLICT (parent_booking_id, occurrence_date) \
             WHERE parent_booking_id IS NOT NULL AND deleted_by IS NULL DO NOTHING",
        );

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to materialize occurrences"))?;

        Ok(result.rows_affected() as usize)
    }
}
