use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::identity::{FailureOutcome, LockoutPolicy};
use keystone_core::models::{AccessLog, RecipientKind, RegisteredDevice, Resident, Staff, User};
use keystone_core::{AppError, AppResult};
use sqlx::{PgExecutor, PgPool, Postgres};
use uuid::Uuid;

use crate::db::transaction::{begin_serializable, commit, retry_on_contention};
use crate::db::{db_error, ensure_written};
use crate::store_traits::IdentityStore;

#[derive(Clone)]
pub struct PgIdentityRepository {
    pool: PgPool,
}

impl PgIdentityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn record_login_failure_once(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy: &LockoutPolicy,
        log: &AccessLog,
        now: DateTime<Utc>,
    ) -> AppResult<FailureOutcome> {
        let mut tx = begin_serializable(&self.pool).await?;

        let mut user = sqlx::query_as::<Postgres, User>(
            r#"
            SELECT * FROM users
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock user for login accounting"))?
        .ok_or(AppError::UserNotFound)?;

        let outcome = policy.register_failure(&mut user, now);

        sqlx::query(
            r#"
            UPDATE users
            SET failed_attempt_count = $3, locked = $4, locked_at = $5,
                updated_on = $6, version = version + 1
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(user.failed_attempt_count)
        .bind(user.locked)
        .bind(user.locked_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to update login failure counters"))?;

        insert_access_log(&mut *tx, log).await?;
        commit(tx).await?;

        if matches!(outcome, FailureOutcome::Locked) {
            tracing::warn!(
                event_type = "user_locked",
                tenant_id = %tenant_id,
                user_id = %user_id,
                "User locked after repeated login failures"
            );
        }

        Ok(outcome)
    }
}

async fn insert_access_log<'e, E: PgExecutor<'e>>(executor: E, log: &AccessLog) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO access_logs (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            user_id, login_status, refresh_jti, refresh_exp, device_id, ip, location
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(log.audit.id)
    .bind(log.audit.version)
    .bind(log.audit.tenant_id)
    .bind(log.audit.created_on)
    .bind(log.audit.updated_on)
    .bind(log.audit.created_by)
    .bind(log.audit.updated_by)
    .bind(log.user_id)
    .bind(log.login_status)
    .bind(&log.refresh_jti)
    .bind(log.refresh_exp)
    .bind(log.device_id)
    .bind(&log.ip)
    .bind(&log.location)
    .execute(executor)
    .await
    .map_err(db_error("Failed to insert access log"))?;

    Ok(())
}

#[async_trait]
impl IdentityStore for PgIdentityRepository {
    #[tracing::instrument(skip(self, login), fields(db.table = "users", db.operation = "select"))]
    async fn find_user_by_login(&self, tenant_id: Uuid, login: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<Postgres, User>(
            r#"
            SELECT * FROM users
            WHERE tenant_id = $1 AND deleted_by IS NULL
              AND (LOWER(email) = LOWER($2) OR username = $2 OR phone = $2)
            ORDER BY created_on
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(login.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find user by login"))?;

        Ok(user)
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select"))]
    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<Postgres, User>(
            r#"
            SELECT * FROM users
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get user"))?;

        Ok(user)
    }

    #[tracing::instrument(skip(self, email), fields(db.table = "users", db.operation = "select"))]
    async fn email_taken(&self, tenant_id: Uuid, email: &str) -> AppResult<bool> {
        let taken = sqlx::query_scalar::<Postgres, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE tenant_id = $1 AND LOWER(email) = LOWER($2) AND deleted_by IS NULL
            )
            "#,
        )
        .bind(tenant_id)
        .bind(email.trim())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to check email uniqueness"))?;

        Ok(taken)
    }

    #[tracing::instrument(skip(self, user), fields(db.table = "users", db.operation = "insert"))]
    async fn insert_user(&self, user: &User) -> AppResult<User> {
        let created = sqlx::query_as::<Postgres, User>(
            r#"
            INSERT INTO users (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                email, username, password_hash, is_active, is_superuser, is_staff, access_level,
                first_name, last_name, phone, country_code, date_of_birth, status,
                locked, failed_attempt_count, locked_at, languages
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            RETURNING *
            "#,
        )
        .bind(user.audit.id)
        .bind(user.audit.version)
        .bind(user.audit.tenant_id)
        .bind(user.audit.created_on)
        .bind(user.audit.updated_on)
        .bind(user.audit.created_by)
        .bind(user.audit.updated_by)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.is_superuser)
        .bind(user.is_staff)
        .bind(user.access_level)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(&user.country_code)
        .bind(user.date_of_birth)
        .bind(user.status)
        .bind(user.locked)
        .bind(user.failed_attempt_count)
        .bind(user.locked_at)
        .bind(&user.languages)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create user"))?;

        tracing::info!(
            user_id = %created.id(),
            tenant_id = %created.audit.tenant_id,
            "User created"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, staff), fields(db.table = "staff", db.operation = "insert"))]
    async fn insert_staff(&self, staff: &Staff) -> AppResult<Staff> {
        let created = sqlx::query_as::<Postgres, Staff>(
            r#"
            INSERT INTO staff (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                user_id, role_ids, scope_ids, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(staff.audit.id)
        .bind(staff.audit.version)
        .bind(staff.audit.tenant_id)
        .bind(staff.audit.created_on)
        .bind(staff.audit.updated_on)
        .bind(staff.audit.created_by)
        .bind(staff.audit.updated_by)
        .bind(staff.user_id)
        .bind(&staff.role_ids)
        .bind(&staff.scope_ids)
        .bind(staff.active)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create staff profile"))?;

        Ok(created)
    }

    #[tracing::instrument(skip(self, resident), fields(db.table = "residents", db.operation = "insert"))]
    async fn insert_resident(&self, resident: &Resident) -> AppResult<Resident> {
        let created = sqlx::query_as::<Postgres, Resident>(
            r#"
            INSERT INTO residents (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                user_id, resident_code, profile_type, role_ids, scope_ids
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(resident.audit.id)
        .bind(resident.audit.version)
        .bind(resident.audit.tenant_id)
        .bind(resident.audit.created_on)
        .bind(resident.audit.updated_on)
        .bind(resident.audit.created_by)
        .bind(resident.audit.updated_by)
        .bind(resident.user_id)
        .bind(&resident.resident_code)
        .bind(resident.profile_type)
        .bind(&resident.role_ids)
        .bind(&resident.scope_ids)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create resident profile"))?;

        Ok(created)
    }

    #[tracing::instrument(skip(self), fields(db.table = "staff", db.operation = "select"))]
    async fn get_staff_by_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<Staff>> {
        let staff = sqlx::query_as::<Postgres, Staff>(
            r#"
            SELECT * FROM staff
            WHERE tenant_id = $1 AND user_id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get staff profile"))?;

        Ok(staff)
    }

    #[tracing::instrument(skip(self), fields(db.table = "residents", db.operation = "select"))]
    async fn get_resident_by_user(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Resident>> {
        let resident = sqlx::query_as::<Postgres, Resident>(
            r#"
            SELECT * FROM residents
            WHERE tenant_id = $1 AND user_id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get resident profile"))?;

        Ok(resident)
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select"))]
    async fn profile_email(
        &self,
        tenant_id: Uuid,
        kind: RecipientKind,
        profile_id: Uuid,
    ) -> AppResult<Option<String>> {
        let profile_table = match kind {
            RecipientKind::Staff => "staff",
            RecipientKind::Resident => "residents",
            RecipientKind::Raw => return Ok(None),
        };
        let email: Option<Option<String>> = sqlx::query_scalar(&format!(
            r#"
            SELECT u.email FROM {profile_table} p
            JOIN users u ON u.id = p.user_id AND u.tenant_id = p.tenant_id
            WHERE p.tenant_id = $1 AND p.id = $2
              AND p.deleted_by IS NULL AND u.deleted_by IS NULL
            "#
        ))
        .bind(tenant_id)
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to resolve profile email"))?;

        Ok(email.flatten())
    }

    #[tracing::instrument(skip(self, policy, log), fields(db.table = "users", db.operation = "update"))]
    async fn record_login_failure(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy: &LockoutPolicy,
        log: &AccessLog,
        now: DateTime<Utc>,
    ) -> AppResult<FailureOutcome> {
        retry_on_contention("record_login_failure", move || {
            self.record_login_failure_once(tenant_id, user_id, policy, log, now)
        })
        .await
    }

    #[tracing::instrument(skip(self, log), fields(db.table = "users", db.operation = "update"))]
    async fn record_login_success(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        log: &AccessLog,
    ) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;

        let rows = sqlx::query(
            r#"
            UPDATE users
            SET failed_attempt_count = 0, locked = FALSE, locked_at = NULL,
                updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to reset login counters"))?
        .rows_affected();
        ensure_written(rows, "user")?;

        insert_access_log(&mut *tx, log).await?;
        commit(tx).await
    }

    #[tracing::instrument(skip(self, device), fields(db.table = "registered_devices", db.operation = "upsert"))]
    async fn upsert_device(&self, device: &RegisteredDevice) -> AppResult<RegisteredDevice> {
        let saved = sqlx::query_as::<Postgres, RegisteredDevice>(
            r#"
            INSERT INTO registered_devices (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                user_id, make, model, mac_address, device_fingerprint, last_seen_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, device_fingerprint) DO UPDATE
            SET make = EXCLUDED.make,
                model = EXCLUDED.model,
                mac_address = EXCLUDED.mac_address,
                last_seen_on = EXCLUDED.last_seen_on,
                updated_on = EXCLUDED.updated_on,
                updated_by = EXCLUDED.updated_by,
                version = registered_devices.version + 1
            RETURNING *
            "#,
        )
        .bind(device.audit.id)
        .bind(device.audit.version)
        .bind(device.audit.tenant_id)
        .bind(device.audit.created_on)
        .bind(device.audit.updated_on)
        .bind(device.audit.created_by)
        .bind(device.audit.updated_by)
        .bind(device.user_id)
        .bind(&device.make)
        .bind(&device.model)
        .bind(&device.mac_address)
        .bind(&device.device_fingerprint)
        .bind(device.last_seen_on)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to register device"))?;

        Ok(saved)
    }

    #[tracing::instrument(skip(self, jti), fields(db.table = "access_logs", db.operation = "select"))]
    async fn find_access_log_by_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
    ) -> AppResult<Option<AccessLog>> {
        let log = sqlx::query_as::<Postgres, AccessLog>(
            r#"
            SELECT * FROM access_logs
            WHERE tenant_id = $1 AND refresh_jti = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find access log by jti"))?;

        Ok(log)
    }

    #[tracing::instrument(skip(self, old_jti, new_jti), fields(db.table = "access_logs", db.operation = "update"))]
    async fn rotate_refresh(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        old_jti: &str,
        new_jti: &str,
        new_exp: DateTime<Utc>,
    ) -> AppResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE access_logs
            SET refresh_jti = $4, refresh_exp = $5, updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND refresh_jti = $3
              AND logged_out_at IS NULL AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(log_id)
        .bind(old_jti)
        .bind(new_jti)
        .bind(new_exp)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to rotate refresh token"))?
        .rows_affected();

        Ok(rows == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "access_logs", db.operation = "update"))]
    async fn mark_logged_out(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE access_logs
            SET logged_out_at = $3, updated_on = $3, version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND logged_out_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(log_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark session logged out"))?
        .rows_affected();

        Ok(rows == 1)
    }

    #[tracing::instrument(skip(self, password_hash), fields(db.table = "users", db.operation = "update"))]
    async fn update_password(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        password_hash: &str,
        actor: Uuid,
    ) -> AppResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $3, failed_attempt_count = 0, locked = FALSE, locked_at = NULL,
                updated_by = $4, updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(password_hash)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to update password"))?
        .rows_affected();
        ensure_written(rows, "user")?;

        tracing::info!(
            event_type = "password_changed",
            tenant_id = %tenant_id,
            user_id = %user_id,
            "Password updated"
        );

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "staff", db.operation = "select"))]
    async fn count_active_staff_with_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<i64> {
        let count = sqlx::query_scalar::<Postgres, i64>(
            r#"
            SELECT COUNT(*) FROM staff
            WHERE tenant_id = $1 AND $2 = ANY(role_ids) AND active AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to count staff holding role"))?;

        Ok(count)
    }
}
