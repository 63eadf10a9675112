use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::models::{
    Bill, BillPaymentPlan, GatewayReconState, Payment, SavedAccount, SavedCard, TransactionLog,
};
use keystone_core::{AppError, AppResult};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres};
use uuid::Uuid;

use super::bill::{write_bill, write_bill_payment_plan};
use crate::db::db_error;
use crate::db::transaction::{begin_serializable, commit};
use crate::store_traits::PaymentStore;

#[derive(Clone)]
pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(super) async fn insert_payment_row<'e, E: PgExecutor<'e>>(
    executor: E,
    payment: &Payment,
) -> AppResult<Payment> {
    let created = sqlx::query_as::<Postgres, Payment>(
        r#"
        INSERT INTO payments (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            bill_id, parent_id, refund_request_id, transaction_type, order_id, amount,
            refund_amount, currency, method, status, gateway_status, transaction_id,
            extra_data, installment_date, payment_term, payment_plan, processed_on
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23, $24
        )
        RETURNING *
        "#,
    )
    .bind(payment.audit.id)
    .bind(payment.audit.version)
    .bind(payment.audit.tenant_id)
    .bind(payment.audit.created_on)
    .bind(payment.audit.updated_on)
    .bind(payment.audit.created_by)
    .bind(payment.audit.updated_by)
    .bind(payment.bill_id)
    .bind(payment.parent_id)
    .bind(payment.refund_request_id)
    .bind(payment.transaction_type)
    .bind(&payment.order_id)
    .bind(payment.amount)
    .bind(payment.refund_amount)
    .bind(&payment.currency)
    .bind(payment.method)
    .bind(payment.status)
    .bind(payment.gateway_status)
    .bind(&payment.transaction_id)
    .bind(&payment.extra_data)
    .bind(payment.installment_date)
    .bind(payment.payment_term)
    .bind(payment.payment_plan)
    .bind(payment.processed_on)
    .fetch_one(executor)
    .await
    .map_err(db_error("Failed to insert payment"))?;

    Ok(created)
}

/// Optimistic write of a payment whose envelope was already bumped.
pub(super) async fn write_payment<'e, E: PgExecutor<'e>>(
    executor: E,
    payment: &Payment,
) -> AppResult<Payment> {
    let updated = sqlx::query_as::<Postgres, Payment>(
        r#"
        UPDATE payments
        SET refund_amount = $3, status = $4, gateway_status = $5, transaction_id = $6,
            extra_data = $7, processed_on = $8, version = $9, updated_on = $10,
            updated_by = $11
        WHERE tenant_id = $1 AND id = $2 AND version = $9 - 1
        RETURNING *
        "#,
    )
    .bind(payment.audit.tenant_id)
    .bind(payment.audit.id)
    .bind(payment.refund_amount)
    .bind(payment.status)
    .bind(payment.gateway_status)
    .bind(&payment.transaction_id)
    .bind(&payment.extra_data)
    .bind(payment.processed_on)
    .bind(payment.audit.version)
    .bind(payment.audit.updated_on)
    .bind(payment.audit.updated_by)
    .fetch_optional(executor)
    .await
    .map_err(db_error("Failed to update payment"))?;

    updated.ok_or_else(|| {
        AppError::Conflict(format!(
            "payment {} was modified concurrently or no longer exists",
            payment.order_id
        ))
    })
}

/// A new primary instrument demotes every other card and account of the resident.
async fn clear_primary(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    resident_id: Uuid,
    keep: Uuid,
) -> AppResult<()> {
    for table in ["saved_cards", "saved_accounts"] {
        sqlx::query(&format!(
            "UPDATE {} SET primary_method = FALSE, updated_on = NOW() \
             WHERE tenant_id = $1 AND resident_id = $2 AND id <> $3 AND primary_method",
            table
        ))
        .bind(tenant_id)
        .bind(resident_id)
        .bind(keep)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to clear primary payment method"))?;
    }
    Ok(())
}

#[async_trait]
impl PaymentStore for PgPaymentRepository {
    #[tracing::instrument(skip(self, payment), fields(db.table = "payments", db.operation = "insert", bill_id = %payment.bill_id))]
    async fn insert_payment(&self, payment: &Payment) -> AppResult<Payment> {
        let created = insert_payment_row(&self.pool, payment).await?;

        tracing::info!(
            payment_id = %created.audit.id,
            order_id = %created.order_id,
            amount = %created.amount,
            method = ?created.method,
            status = ?created.status,
            "Payment recorded"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, payment), fields(db.table = "payments", db.operation = "update"))]
    async fn update_payment(&self, payment: &Payment) -> AppResult<Payment> {
        write_payment(&self.pool, payment).await
    }

    #[tracing::instrument(skip(self), fields(db.table = "payments", db.operation = "select"))]
    async fn get_payment(&self, tenant_id: Uuid, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<Postgres, Payment>(
            "SELECT * FROM payments WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment"))?;

        Ok(payment)
    }

    #[tracing::instrument(skip(self), fields(db.table = "payments", db.operation = "select"))]
    async fn payments_for_bill(&self, tenant_id: Uuid, bill_id: Uuid) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<Postgres, Payment>(
            r#"
            SELECT * FROM payments
            WHERE tenant_id = $1 AND bill_id = $2 AND deleted_by IS NULL
            ORDER BY created_on
            "#,
        )
        .bind(tenant_id)
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list bill payments"))?;

        Ok(payments)
    }

    #[tracing::instrument(skip(self), fields(db.table = "payments", db.operation = "select"))]
    async fn pending_gateway_payments(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<Postgres, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status IN ('PENDING', 'IN_PROCESS')
              AND method IN ('CREDIT_CARD', 'DEBIT_CARD', 'BANK_TRANSFER', 'POS_PAYMENT', 'BACK_TO_SOURCE')
              AND created_on < $1
              AND deleted_by IS NULL
            ORDER BY created_on
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list pending gateway payments"))?;

        Ok(payments)
    }

    #[tracing::instrument(skip(self, payment, bill), fields(db.table = "payments", db.operation = "settle", bill_id = %bill.id()))]
    async fn settle_payment(&self, payment: &Payment, bill: &Bill) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;
        write_payment(&mut *tx, payment).await?;
        write_bill(&mut *tx, bill).await?;
        commit(tx).await?;

        tracing::info!(
            payment_id = %payment.audit.id,
            status = ?payment.status,
            bill_status = ?bill.status,
            paid_amount = %bill.paid_amount,
            "Payment settled"
        );

        Ok(())
    }

    #[tracing::instrument(skip(self, payment, bill, plan), fields(db.table = "payments", db.operation = "settle_installment", bill_id = %bill.id()))]
    async fn settle_installment(
        &self,
        payment: &Payment,
        bill: &Bill,
        plan: &BillPaymentPlan,
    ) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;
        write_payment(&mut *tx, payment).await?;
        write_bill(&mut *tx, bill).await?;
        write_bill_payment_plan(&mut *tx, plan).await?;
        commit(tx).await?;

        tracing::info!(
            payment_id = %payment.audit.id,
            status = ?payment.status,
            installments_paid = plan.installments_paid,
            plan_active = plan.active,
            "Installment settled"
        );

        Ok(())
    }

    #[tracing::instrument(skip(self, log), fields(db.table = "transaction_logs", db.operation = "insert"))]
    async fn log_transaction(&self, log: &TransactionLog) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_logs (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                payment_id, event, event_source, request, response, success
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(log.audit.id)
        .bind(log.audit.version)
        .bind(log.audit.tenant_id)
        .bind(log.audit.created_on)
        .bind(log.audit.updated_on)
        .bind(log.audit.created_by)
        .bind(log.audit.updated_by)
        .bind(log.payment_id)
        .bind(log.event)
        .bind(log.event_source)
        .bind(&log.request)
        .bind(&log.response)
        .bind(log.success)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to write transaction log"))?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "saved_cards", db.operation = "select"))]
    async fn get_saved_card(&self, tenant_id: Uuid, card_id: Uuid) -> AppResult<Option<SavedCard>> {
        let card = sqlx::query_as::<Postgres, SavedCard>(
            "SELECT * FROM saved_cards WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get saved card"))?;

        Ok(card)
    }

    #[tracing::instrument(skip(self), fields(db.table = "saved_accounts", db.operation = "select"))]
    async fn get_saved_account(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> AppResult<Option<SavedAccount>> {
        let account = sqlx::query_as::<Postgres, SavedAccount>(
            "SELECT * FROM saved_accounts WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get saved account"))?;

        Ok(account)
    }

    #[tracing::instrument(skip(self, card), fields(db.table = "saved_cards", db.operation = "insert"))]
    async fn save_card(&self, card: &SavedCard) -> AppResult<SavedCard> {
        let mut tx = begin_serializable(&self.pool).await?;

        if card.primary_method {
            clear_primary(&mut tx, card.audit.tenant_id, card.resident_id, card.audit.id).await?;
        }

        let saved = sqlx::query_as::<Postgres, SavedCard>(
            r#"
            INSERT INTO saved_cards (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                resident_id, card_encrypted, last_four, brand, expiry_month, expiry_year,
                holder_name, primary_method
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(card.audit.id)
        .bind(card.audit.version)
        .bind(card.audit.tenant_id)
        .bind(card.audit.created_on)
        .bind(card.audit.updated_on)
        .bind(card.audit.created_by)
        .bind(card.audit.updated_by)
        .bind(card.resident_id)
        .bind(&card.card_encrypted)
        .bind(&card.last_four)
        .bind(&card.brand)
        .bind(card.expiry_month)
        .bind(card.expiry_year)
        .bind(&card.holder_name)
        .bind(card.primary_method)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to save card"))?;

        commit(tx).await?;

        tracing::info!(
            card_id = %saved.audit.id,
            resident_id = %saved.resident_id,
            last_four = %saved.last_four,
            primary = saved.primary_method,
            "Card saved"
        );

        Ok(saved)
    }

    #[tracing::instrument(skip(self, account), fields(db.table = "saved_accounts", db.operation = "insert"))]
    async fn save_account(&self, account: &SavedAccount) -> AppResult<SavedAccount> {
        let mut tx = begin_serializable(&self.pool).await?;

        if account.primary_method {
            clear_primary(
                &mut tx,
                account.audit.tenant_id,
                account.resident_id,
                account.audit.id,
            )
            .await?;
        }

        let saved = sqlx::query_as::<Postgres, SavedAccount>(
            r#"
            INSERT INTO saved_accounts (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                resident_id, account_encrypted, routing_encrypted, last_four, account_type,
                holder_name, primary_method
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(account.audit.id)
        .bind(account.audit.version)
        .bind(account.audit.tenant_id)
        .bind(account.audit.created_on)
        .bind(account.audit.updated_on)
        .bind(account.audit.created_by)
        .bind(account.audit.updated_by)
        .bind(account.resident_id)
        .bind(&account.account_encrypted)
        .bind(&account.routing_encrypted)
        .bind(&account.last_four)
        .bind(&account.account_type)
        .bind(&account.holder_name)
        .bind(account.primary_method)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to save account"))?;

        commit(tx).await?;

        tracing::info!(
            account_id = %saved.audit.id,
            resident_id = %saved.resident_id,
            primary = saved.primary_method,
            "Bank account saved"
        );

        Ok(saved)
    }

    #[tracing::instrument(skip(self), fields(db.table = "gateway_recon_state", db.operation = "select"))]
    async fn recon_state(&self, tenant_id: Uuid) -> AppResult<Option<GatewayReconState>> {
        let state = sqlx::query_as::<Postgres, GatewayReconState>(
            "SELECT * FROM gateway_recon_state WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load reconciliation state"))?;

        Ok(state)
    }

    #[tracing::instrument(skip(self, state), fields(db.table = "gateway_recon_state", db.operation = "upsert"))]
    async fn save_recon_state(&self, state: &GatewayReconState) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_recon_state (tenant_id, gateway_recon_last_request_id, last_run_on)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO UPDATE
            SET gateway_recon_last_request_id = EXCLUDED.gateway_recon_last_request_id,
                last_run_on = EXCLUDED.last_run_on
            "#,
        )
        .bind(state.tenant_id)
        .bind(&state.gateway_recon_last_request_id)
        .bind(state.last_run_on)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to save reconciliation state"))?;

        Ok(())
    }
}
