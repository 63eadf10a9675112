use async_trait::async_trait;
use keystone_core::models::{Policy, PolicyStatus, PolicyVersion, UserPolicyAcceptance};
use keystone_core::{AppError, AppResult};
use sqlx::{PgExecutor, PgPool, Postgres};
use uuid::Uuid;

use crate::db::transaction::{begin_serializable, commit};
use crate::db::{db_error, ensure_written};
use crate::store_traits::PolicyStore;

#[derive(Clone)]
pub struct PgPolicyRepository {
    pool: PgPool,
}

impl PgPolicyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_version<'e, E: PgExecutor<'e>>(
    executor: E,
    version: &PolicyVersion,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO policy_versions (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            policy_id, version_number, content_html, pdf_ref
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(version.audit.id)
    .bind(version.audit.version)
    .bind(version.audit.tenant_id)
    .bind(version.audit.created_on)
    .bind(version.audit.updated_on)
    .bind(version.audit.created_by)
    .bind(version.audit.updated_by)
    .bind(version.policy_id)
    .bind(version.version_number)
    .bind(&version.content_html)
    .bind(&version.pdf_ref)
    .execute(executor)
    .await
    .map_err(db_error("Failed to insert policy version"))?;

    Ok(())
}

#[async_trait]
impl PolicyStore for PgPolicyRepository {
    #[tracing::instrument(skip(self, policy, version), fields(db.table = "policies", db.operation = "insert"))]
    async fn create_policy(&self, policy: &Policy, version: &PolicyVersion) -> AppResult<Policy> {
        let mut tx = begin_serializable(&self.pool).await?;

        let created = sqlx::query_as::<Postgres, Policy>(
            r#"
            INSERT INTO policies (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                name, status, policy_type, publishing_date, current_version_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL)
            RETURNING *
            "#,
        )
        .bind(policy.audit.id)
        .bind(policy.audit.version)
        .bind(policy.audit.tenant_id)
        .bind(policy.audit.created_on)
        .bind(policy.audit.updated_on)
        .bind(policy.audit.created_by)
        .bind(policy.audit.updated_by)
        .bind(&policy.name)
        .bind(policy.status)
        .bind(&policy.policy_type)
        .bind(policy.publishing_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create policy"))?;

        insert_version(&mut *tx, version).await?;

        let created = sqlx::query_as::<Postgres, Policy>(
            "UPDATE policies SET current_version_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(created.audit.id)
        .bind(version.audit.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to point policy at its first version"))?;

        commit(tx).await?;

        tracing::info!(
            policy_id = %created.audit.id,
            tenant_id = %created.audit.tenant_id,
            "Policy created"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self), fields(db.table = "policies", db.operation = "select"))]
    async fn get_policy(&self, tenant_id: Uuid, policy_id: Uuid) -> AppResult<Option<Policy>> {
        let policy = sqlx::query_as::<Postgres, Policy>(
            "SELECT * FROM policies WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get policy"))?;

        Ok(policy)
    }

    #[tracing::instrument(skip(self), fields(db.table = "policies", db.operation = "select"))]
    async fn list_policies(
        &self,
        tenant_id: Uuid,
        status: Option<PolicyStatus>,
    ) -> AppResult<Vec<Policy>> {
        let policies = sqlx::query_as::<Postgres, Policy>(
            r#"
            SELECT * FROM policies
            WHERE tenant_id = $1 AND deleted_by IS NULL
              AND ($2::policy_status IS NULL OR status = $2)
            ORDER BY created_on DESC
            "#,
        )
        .bind(tenant_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list policies"))?;

        Ok(policies)
    }

    #[tracing::instrument(skip(self), fields(db.table = "policy_versions", db.operation = "select"))]
    async fn latest_version(
        &self,
        tenant_id: Uuid,
        policy_id: Uuid,
    ) -> AppResult<Option<PolicyVersion>> {
        let version = sqlx::query_as::<Postgres, PolicyVersion>(
            r#"
            SELECT * FROM policy_versions
            WHERE tenant_id = $1 AND policy_id = $2 AND deleted_by IS NULL
            ORDER BY version_number DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get latest policy version"))?;

        Ok(version)
    }

    #[tracing::instrument(skip(self, policy, new_version), fields(db.table = "policies", db.operation = "update"))]
    async fn save_policy(
        &self,
        policy: &Policy,
        new_version: Option<&PolicyVersion>,
    ) -> AppResult<Policy> {
        let mut tx = begin_serializable(&self.pool).await?;

        if let Some(version) = new_version {
            insert_version(&mut *tx, version).await?;
        }

        let saved = sqlx::query_as::<Postgres, Policy>(
            r#"
            UPDATE policies
            SET name = $3, status = $4, policy_type = $5, publishing_date = $6,
                current_version_id = $7, version = $8, updated_on = $9, updated_by = $10
            WHERE tenant_id = $1 AND id = $2 AND version = $8 - 1 AND deleted_by IS NULL
            RETURNING *
            "#,
        )
        .bind(policy.audit.tenant_id)
        .bind(policy.audit.id)
        .bind(&policy.name)
        .bind(policy.status)
        .bind(&policy.policy_type)
        .bind(policy.publishing_date)
        .bind(policy.current_version_id)
        .bind(policy.audit.version)
        .bind(policy.audit.updated_on)
        .bind(policy.audit.updated_by)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to update policy"))?;

        let saved = saved.ok_or_else(|| {
            AppError::Conflict("policy was modified concurrently or no longer exists".to_string())
        })?;

        commit(tx).await?;

        tracing::info!(
            policy_id = %saved.audit.id,
            new_version = new_version.map(|v| v.version_number),
            "Policy updated"
        );

        Ok(saved)
    }

    #[tracing::instrument(skip(self, pdf_ref), fields(db.table = "policy_versions", db.operation = "update"))]
    async fn set_version_pdf(
        &self,
        tenant_id: Uuid,
        version_id: Uuid,
        pdf_ref: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE policy_versions SET pdf_ref = $3, updated_on = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(version_id)
        .bind(pdf_ref)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to store policy pdf reference"))?;

        ensure_written(result.rows_affected(), "policy version")
    }

    #[tracing::instrument(skip(self, acceptance), fields(db.table = "user_policy_acceptances", db.operation = "insert"))]
    async fn insert_acceptance(&self, acceptance: &UserPolicyAcceptance) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_policy_acceptances (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                user_id, policy_version_id, accepted_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, policy_version_id) DO NOTHING
            "#,
        )
        .bind(acceptance.audit.id)
        .bind(acceptance.audit.version)
        .bind(acceptance.audit.tenant_id)
        .bind(acceptance.audit.created_on)
        .bind(acceptance.audit.updated_on)
        .bind(acceptance.audit.created_by)
        .bind(acceptance.audit.updated_by)
        .bind(acceptance.user_id)
        .bind(acceptance.policy_version_id)
        .bind(acceptance.accepted_on)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record policy acceptance"))?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, policy_ids), fields(db.table = "user_policy_acceptances", db.operation = "select"))]
    async fn accepted_versions(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>> {
        let rows = sqlx::query_as::<Postgres, (Uuid, i32)>(
            r#"
            SELECT v.policy_id, MAX(v.version_number)
            FROM user_policy_acceptances a
            JOIN policy_versions v ON v.id = a.policy_version_id
            WHERE a.tenant_id = $1 AND a.user_id = $2 AND v.policy_id = ANY($3)
              AND a.deleted_by IS NULL
            GROUP BY v.policy_id
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(policy_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load accepted policy versions"))?;

        Ok(rows)
    }

    #[tracing::instrument(skip(self, policy_ids), fields(db.table = "policy_versions", db.operation = "select"))]
    async fn latest_versions(
        &self,
        tenant_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>> {
        let rows = sqlx::query_as::<Postgres, (Uuid, i32)>(
            r#"
            SELECT policy_id, MAX(version_number)
            FROM policy_versions
            WHERE tenant_id = $1 AND policy_id = ANY($2) AND deleted_by IS NULL
            GROUP BY policy_id
            "#,
        )
        .bind(tenant_id)
        .bind(policy_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load latest policy versions"))?;

        Ok(rows)
    }
}
