use async_trait::async_trait;
use keystone_core::models::Tenant;
use keystone_core::AppResult;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::db_error;
use crate::store_traits::TenantStore;

#[derive(Clone)]
pub struct PgTenantRepository {
    pool: PgPool,
}

impl PgTenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantStore for PgTenantRepository {
    #[tracing::instrument(skip(self), fields(db.table = "tenants", db.operation = "select"))]
    async fn get_tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<Postgres, Tenant>(
            r#"
            SELECT * FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get tenant"))?;

        Ok(tenant)
    }

    #[tracing::instrument(skip(self), fields(db.table = "tenants", db.operation = "select"))]
    async fn list_active_tenants(&self) -> AppResult<Vec<Tenant>> {
        let tenants = sqlx::query_as::<Postgres, Tenant>(
            r#"
            SELECT * FROM tenants
            WHERE status = 'active'
            ORDER BY created_on
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list active tenants"))?;

        Ok(tenants)
    }
}
