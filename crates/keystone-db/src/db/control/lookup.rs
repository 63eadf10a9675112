use async_trait::async_trait;
use keystone_core::models::{BillCancellationCodeComposition, Lookup};
use keystone_core::AppResult;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::db_error;
use crate::store_traits::LookupStore;

/// Tenant-scoped code tables.
#[derive(Clone)]
pub struct PgLookupRepository {
    pool: PgPool,
}

impl PgLookupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LookupStore for PgLookupRepository {
    #[tracing::instrument(skip(self), fields(db.table = "lookups", db.operation = "select"))]
    async fn list_lookups(&self, tenant_id: Uuid) -> AppResult<Vec<Lookup>> {
        let lookups = sqlx::query_as::<Postgres, Lookup>(
            r#"
            SELECT * FROM lookups
            WHERE tenant_id = $1 AND deleted_by IS NULL
            ORDER BY name, sort_order
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list lookups"))?;

        Ok(lookups)
    }

    #[tracing::instrument(skip(self), fields(db.table = "bill_cancellation_code_compositions", db.operation = "select"))]
    async fn cancellation_code(
        &self,
        tenant_id: Uuid,
        reason: &str,
    ) -> AppResult<Option<BillCancellationCodeComposition>> {
        let composition = sqlx::query_as::<Postgres, BillCancellationCodeComposition>(
            r#"
            SELECT * FROM bill_cancellation_code_compositions
            WHERE tenant_id = $1 AND cancellation_reason = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to resolve cancellation code"))?;

        Ok(composition)
    }
}
