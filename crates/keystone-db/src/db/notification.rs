//! Outbound notification queue
//!
//! Rows are leased by pushing `next_attempt_at` forward under `FOR UPDATE SKIP LOCKED`, so
//! several workers can poll the same table without delivering a row twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::models::Notification;
use keystone_core::AppResult;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::{db_error, ensure_written};
use crate::store_traits::NotificationStore;

#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationRepository {
    #[tracing::instrument(skip(self, notification), fields(db.table = "notifications", db.operation = "insert", template = ?notification.template))]
    async fn enqueue(&self, notification: &Notification) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                channel, recipient_kind, recipient, template, context, status, attempts,
                next_attempt_at, last_error, sent_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(notification.audit.id)
        .bind(notification.audit.version)
        .bind(notification.audit.tenant_id)
        .bind(notification.audit.created_on)
        .bind(notification.audit.updated_on)
        .bind(notification.audit.created_by)
        .bind(notification.audit.updated_by)
        .bind(notification.channel)
        .bind(notification.recipient_kind)
        .bind(&notification.recipient)
        .bind(notification.template)
        .bind(&notification.context)
        .bind(notification.status)
        .bind(notification.attempts)
        .bind(notification.next_attempt_at)
        .bind(&notification.last_error)
        .bind(notification.sent_on)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to enqueue notification"))?;

        tracing::debug!(notification_id = %notification.audit.id, "Notification queued");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "notifications", db.operation = "claim"))]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let claimed = sqlx::query_as::<Postgres, Notification>(
            r#"
            UPDATE notifications
            SET next_attempt_at = $2, updated_on = $1
            WHERE id IN (
                SELECT id FROM notifications
                WHERE status = 'QUEUED' AND next_attempt_at <= $1 AND deleted_by IS NULL
                ORDER BY next_attempt_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to claim due notifications"))?;

        Ok(claimed)
    }

    #[tracing::instrument(skip(self), fields(db.table = "notifications", db.operation = "update"))]
    async fn mark_sent(&self, notification_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'SENT', sent_on = $2, attempts = attempts + 1, last_error = NULL,
                updated_on = $2, version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark notification sent"))?;

        ensure_written(result.rows_affected(), "notification")
    }

    #[tracing::instrument(skip(self, error), fields(db.table = "notifications", db.operation = "update"))]
    async fn mark_retry(
        &self,
        notification_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET attempts = $2, next_attempt_at = $3, last_error = $4,
                updated_on = NOW(), version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to reschedule notification"))?;

        ensure_written(result.rows_affected(), "notification")
    }

    #[tracing::instrument(skip(self, error), fields(db.table = "notifications", db.operation = "update"))]
    async fn mark_failed(&self, notification_id: Uuid, attempts: i32, error: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'FAILED', attempts = $2, last_error = $3,
                updated_on = NOW(), version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark notification failed"))?;

        tracing::warn!(notification_id = %notification_id, attempts, "Notification delivery gave up");
        ensure_written(result.rows_affected(), "notification")
    }
}
