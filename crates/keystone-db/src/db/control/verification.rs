use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::models::{UserType, VerificationChannel, VerificationCode};
use keystone_core::AppResult;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::db_error;
use crate::store_traits::VerificationStore;

#[derive(Clone)]
pub struct PgVerificationRepository {
    pool: PgPool,
}

impl PgVerificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VerificationStore for PgVerificationRepository {
    #[tracing::instrument(skip(self), fields(db.table = "verification_codes", db.operation = "select"))]
    async fn get_code(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        channel: VerificationChannel,
    ) -> AppResult<Option<VerificationCode>> {
        let code = sqlx::query_as::<Postgres, VerificationCode>(
            r#"
            SELECT * FROM verification_codes
            WHERE tenant_id = $1 AND user_id = $2 AND user_type = $3 AND channel = $4
              AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(user_type)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get verification code"))?;

        Ok(code)
    }

    #[tracing::instrument(skip(self, code), fields(db.table = "verification_codes", db.operation = "upsert"))]
    async fn upsert_code(&self, code: &VerificationCode) -> AppResult<VerificationCode> {
        let saved = sqlx::query_as::<Postgres, VerificationCode>(
            r#"
            INSERT INTO verification_codes (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                user_id, user_type, channel, otp_type, code, expires_on, last_sent_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (tenant_id, user_id, user_type, channel) DO UPDATE
            SET otp_type = EXCLUDED.otp_type,
                code = EXCLUDED.code,
                expires_on = EXCLUDED.expires_on,
                last_sent_on = EXCLUDED.last_sent_on,
                consumed_on = NULL,
                deleted_by = NULL,
                updated_on = EXCLUDED.updated_on,
                updated_by = EXCLUDED.updated_by,
                version = verification_codes.version + 1
            RETURNING *
            "#,
        )
        .bind(code.audit.id)
        .bind(code.audit.version)
        .bind(code.audit.tenant_id)
        .bind(code.audit.created_on)
        .bind(code.audit.updated_on)
        .bind(code.audit.created_by)
        .bind(code.audit.updated_by)
        .bind(code.user_id)
        .bind(code.user_type)
        .bind(code.channel)
        .bind(code.otp_type)
        .bind(&code.code)
        .bind(code.expires_on)
        .bind(code.last_sent_on)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to store verification code"))?;

        Ok(saved)
    }

    #[tracing::instrument(skip(self, user_ids), fields(db.table = "verification_codes", db.operation = "select"))]
    async fn find_live_codes(
        &self,
        tenant_id: Uuid,
        user_ids: &[Uuid],
        user_type: UserType,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<VerificationCode>> {
        let codes = sqlx::query_as::<Postgres, VerificationCode>(
            r#"
            SELECT * FROM verification_codes
            WHERE tenant_id = $1 AND user_id = ANY($2) AND user_type = $3
              AND consumed_on IS NULL AND expires_on > $4 AND deleted_by IS NULL
            ORDER BY last_sent_on DESC
            "#,
        )
        .bind(tenant_id)
        .bind(user_ids)
        .bind(user_type)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to find live verification codes"))?;

        Ok(codes)
    }

    #[tracing::instrument(skip(self), fields(db.table = "verification_codes", db.operation = "update"))]
    async fn consume_code(
        &self,
        tenant_id: Uuid,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE verification_codes
            SET consumed_on = $3, updated_on = $3, version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND consumed_on IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(code_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to consume verification code"))?
        .rows_affected();

        Ok(rows == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "verification_codes", db.operation = "delete"))]
    async fn retire_code(&self, tenant_id: Uuid, code_id: Uuid, actor: Uuid) -> AppResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE verification_codes
            SET deleted_by = $3, updated_by = $3, updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(code_id)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to retire verification code"))?
        .rows_affected();

        Ok(rows == 1)
    }
}
