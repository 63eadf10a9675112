use async_trait::async_trait;
use keystone_core::models::{Bill, BillRefundRequest, Payment};
use keystone_core::{AppError, AppResult, RequestContext};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::bill::write_bill;
use super::payment::{insert_payment_row, write_payment};
use crate::db::db_error;
use crate::db::scope::scoped_select;
use crate::db::transaction::{begin_serializable, commit};
use crate::store_traits::RefundStore;

/// Refund requests and the child refund payments they fan out into.
#[derive(Clone)]
pub struct PgRefundRepository {
    pool: PgPool,
}

impl PgRefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundStore for PgRefundRepository {
    #[tracing::instrument(skip(self, request, children, bill), fields(db.table = "bill_refund_requests", db.operation = "insert", bill_id = %bill.id()))]
    async fn create_refund_request(
        &self,
        request: &BillRefundRequest,
        children: &[Payment],
        bill: &Bill,
    ) -> AppResult<BillRefundRequest> {
        let mut tx = begin_serializable(&self.pool).await?;

        let created = sqlx::query_as::<Postgres, BillRefundRequest>(
            r#"
            INSERT INTO bill_refund_requests (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                display_id, bill_id, refund_type, total_refund_requested,
                total_refund_processed, currency, refund_reason, status, process_handle
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *
            "#,
        )
        .bind(request.audit.id)
        .bind(request.audit.version)
        .bind(request.audit.tenant_id)
        .bind(request.audit.created_on)
        .bind(request.audit.updated_on)
        .bind(request.audit.created_by)
        .bind(request.audit.updated_by)
        .bind(&request.display_id)
        .bind(request.bill_id)
        .bind(request.refund_type)
        .bind(request.total_refund_requested)
        .bind(request.total_refund_processed)
        .bind(&request.currency)
        .bind(&request.refund_reason)
        .bind(request.status)
        .bind(request.process_handle)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create refund request"))?;

        for child in children {
            insert_payment_row(&mut *tx, child).await?;
        }
        write_bill(&mut *tx, bill).await?;

        commit(tx).await?;

        tracing::info!(
            event_type = "refund_initiated",
            tenant_id = %created.audit.tenant_id,
            user_id = ?created.audit.created_by,
            refund_request_id = %created.audit.id,
            bill_id = %created.bill_id,
            total_refund_requested = %created.total_refund_requested,
            transactions = children.len(),
            "Refund request created"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, ctx), fields(db.table = "bill_refund_requests", db.operation = "select"))]
    async fn get_refund_request(
        &self,
        ctx: &RequestContext,
        request_id: Uuid,
    ) -> AppResult<Option<BillRefundRequest>> {
        let mut qb = scoped_select::<BillRefundRequest>(ctx);
        qb.push(" AND bill_refund_requests.id = ");
        qb.push_bind(request_id);

        let request = qb
            .build_query_as::<BillRefundRequest>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get refund request"))?;

        Ok(request)
    }

    #[tracing::instrument(skip(self), fields(db.table = "payments", db.operation = "select"))]
    async fn refund_children(&self, tenant_id: Uuid, request_id: Uuid) -> AppResult<Vec<Payment>> {
        let children = sqlx::query_as::<Postgres, Payment>(
            r#"
            SELECT * FROM payments
            WHERE tenant_id = $1 AND refund_request_id = $2 AND transaction_type = 'refund'
              AND deleted_by IS NULL
            ORDER BY created_on, id
            "#,
        )
        .bind(tenant_id)
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list refund transactions"))?;

        Ok(children)
    }

    #[tracing::instrument(skip(self, child, parent, offset), fields(db.table = "payments", db.operation = "update"))]
    async fn record_refund_progress(
        &self,
        child: &Payment,
        parent: Option<&Payment>,
        offset: Option<&Payment>,
    ) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;
        write_payment(&mut *tx, child).await?;
        if let Some(parent) = parent {
            write_payment(&mut *tx, parent).await?;
        }
        if let Some(offset) = offset {
            insert_payment_row(&mut *tx, offset).await?;
        }
        commit(tx).await?;

        tracing::debug!(
            payment_id = %child.audit.id,
            status = ?child.status,
            parent_id = ?parent.map(|p| p.audit.id),
            offset_id = ?offset.map(|o| o.audit.id),
            "Refund transaction processed"
        );

        Ok(())
    }

    #[tracing::instrument(skip(self, request, bill), fields(db.table = "bill_refund_requests", db.operation = "update"))]
    async fn finish_refund_request(
        &self,
        request: &BillRefundRequest,
        bill: &Bill,
    ) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;

        let result = sqlx::query(
            r#"
            UPDATE bill_refund_requests
            SET status = $3, total_refund_processed = $4, process_handle = $5,
                version = $6, updated_on = $7, updated_by = $8
            WHERE tenant_id = $1 AND id = $2 AND version = $6 - 1
            "#,
        )
        .bind(request.audit.tenant_id)
        .bind(request.audit.id)
        .bind(request.status)
        .bind(request.total_refund_processed)
        .bind(request.process_handle)
        .bind(request.audit.version)
        .bind(request.audit.updated_on)
        .bind(request.audit.updated_by)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to update refund request"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "refund request {} was modified concurrently",
                request.display_id
            )));
        }

        write_bill(&mut *tx, bill).await?;
        commit(tx).await?;

        tracing::info!(
            refund_request_id = %request.audit.id,
            status = ?request.status,
            total_refund_processed = %request.total_refund_processed,
            bill_status = ?bill.status,
            "Refund request finished"
        );

        Ok(())
    }
}
