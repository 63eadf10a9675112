use async_trait::async_trait;
use keystone_core::models::{
    AppliedRule, Bill, BillAggregate, BillBreakDown, BillPaymentPlan, BillSummary, PaymentPlan,
    TaxPerState,
};
use keystone_core::{AppError, AppResult, RequestContext};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::db::db_error;
use crate::db::scope::scoped_select;
use crate::db::transaction::{begin_serializable, commit};
use crate::store_traits::BillingStore;

#[derive(Clone)]
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_bill<'e, E: PgExecutor<'e>>(executor: E, bill: &Bill) -> AppResult<Bill> {
    let created = sqlx::query_as::<Postgres, Bill>(
        r#"
        INSERT INTO bills (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            display_id, resident_id, location_id, service_description, service_date,
            statement_date, due_date, paid_date, status, currency, tax_state, total_charges,
            insurance_paid, patient_amount, other_discount, other_adjustment, other_writeoff,
            other_tax, paid_amount, refunded_amount, cancellation_reason, cancellation_code
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
        )
        RETURNING *
        "#,
    )
    .bind(bill.audit.id)
    .bind(bill.audit.version)
    .bind(bill.audit.tenant_id)
    .bind(bill.audit.created_on)
    .bind(bill.audit.updated_on)
    .bind(bill.audit.created_by)
    .bind(bill.audit.updated_by)
    .bind(&bill.display_id)
    .bind(bill.resident_id)
    .bind(bill.location_id)
    .bind(&bill.service_description)
    .bind(bill.service_date)
    .bind(bill.statement_date)
    .bind(bill.due_date)
    .bind(bill.paid_date)
    .bind(bill.status)
    .bind(&bill.currency)
    .bind(&bill.tax_state)
    .bind(bill.total_charges)
    .bind(bill.insurance_paid)
    .bind(bill.patient_amount)
    .bind(bill.other_discount)
    .bind(bill.other_adjustment)
    .bind(bill.other_writeoff)
    .bind(bill.other_tax)
    .bind(bill.paid_amount)
    .bind(bill.refunded_amount)
    .bind(&bill.cancellation_reason)
    .bind(&bill.cancellation_code)
    .fetch_one(executor)
    .await
    .map_err(db_error("Failed to create bill"))?;

    Ok(created)
}

/// Optimistic write of the bill row. The envelope must already carry the bumped version.
pub(super) async fn write_bill<'e, E: PgExecutor<'e>>(executor: E, bill: &Bill) -> AppResult<Bill> {
    let updated = sqlx::query_as::<Postgres, Bill>(
        r#"
        UPDATE bills
        SET location_id = $3, service_description = $4, service_date = $5,
            statement_date = $6, due_date = $7, paid_date = $8, status = $9, currency = $10,
            tax_state = $11, total_charges = $12, insurance_paid = $13, patient_amount = $14,
            other_discount = $15, other_adjustment = $16, other_writeoff = $17,
            other_tax = $18, paid_amount = $19, refunded_amount = $20,
            cancellation_reason = $21, cancellation_code = $22,
            version = $23, updated_on = $24, updated_by = $25, deleted_by = $26
        WHERE tenant_id = $1 AND id = $2 AND version = $23 - 1
        RETURNING *
        "#,
    )
    .bind(bill.audit.tenant_id)
    .bind(bill.audit.id)
    .bind(bill.location_id)
    .bind(&bill.service_description)
    .bind(bill.service_date)
    .bind(bill.statement_date)
    .bind(bill.due_date)
    .bind(bill.paid_date)
    .bind(bill.status)
    .bind(&bill.currency)
    .bind(&bill.tax_state)
    .bind(bill.total_charges)
    .bind(bill.insurance_paid)
    .bind(bill.patient_amount)
    .bind(bill.other_discount)
    .bind(bill.other_adjustment)
    .bind(bill.other_writeoff)
    .bind(bill.other_tax)
    .bind(bill.paid_amount)
    .bind(bill.refunded_amount)
    .bind(&bill.cancellation_reason)
    .bind(&bill.cancellation_code)
    .bind(bill.audit.version)
    .bind(bill.audit.updated_on)
    .bind(bill.audit.updated_by)
    .bind(bill.audit.deleted_by)
    .fetch_optional(executor)
    .await
    .map_err(db_error("Failed to update bill"))?;

    updated.ok_or_else(|| {
        AppError::Conflict(format!(
            "bill {} was modified concurrently or no longer exists",
            bill.display_id
        ))
    })
}

async fn insert_breakdowns(conn: &mut PgConnection, rows: &[BillBreakDown]) -> AppResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO bill_breakdowns (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            bill_id, position, category, type_of_service, description, quantity,
            type_of_service_amount, service_taxable, other_fees, other_fees_taxable,
            insurance_amount, sub_total, taxable_amount, tax, total_amount, patient_amount,
            currency, service_start_date, service_end_date
        ) "#,
    );
    qb.push_values(rows, |mut row, line| {
        row.push_bind(line.audit.id)
            .push_bind(line.audit.version)
            .push_bind(line.audit.tenant_id)
            .push_bind(line.audit.created_on)
            .push_bind(line.audit.updated_on)
            .push_bind(line.audit.created_by)
            .push_bind(line.audit.updated_by)
            .push_bind(line.bill_id)
            .push_bind(line.position)
            .push_bind(line.category.clone())
            .push_bind(line.type_of_service.clone())
            .push_bind(line.description.clone())
            .push_bind(line.quantity)
            .push_bind(line.type_of_service_amount)
            .push_bind(line.service_taxable)
            .push_bind(line.other_fees)
            .push_bind(line.other_fees_taxable)
            .push_bind(line.insurance_amount)
            .push_bind(line.sub_total)
            .push_bind(line.taxable_amount)
            .push_bind(line.tax)
            .push_bind(line.total_amount)
            .push_bind(line.patient_amount)
            .push_bind(line.currency.clone())
            .push_bind(line.service_start_date)
            .push_bind(line.service_end_date);
    });
    qb.build()
        .execute(conn)
        .await
        .map_err(db_error("Failed to insert bill breakdowns"))?;
    Ok(())
}

async fn insert_applied_rules(conn: &mut PgConnection, rows: &[AppliedRule]) -> AppResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO applied_rules (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            bill_id, breakdown_id, kind, name, rule_type, value, max_upto, direction,
            amount, taxable
        ) "#,
    );
    qb.push_values(rows, |mut row, rule| {
        row.push_bind(rule.audit.id)
            .push_bind(rule.audit.version)
            .push_bind(rule.audit.tenant_id)
            .push_bind(rule.audit.created_on)
            .push_bind(rule.audit.updated_on)
            .push_bind(rule.audit.created_by)
            .push_bind(rule.audit.updated_by)
            .push_bind(rule.bill_id)
            .push_bind(rule.breakdown_id)
            .push_bind(rule.kind)
            .push_bind(rule.name.clone())
            .push_bind(rule.rule_type)
            .push_bind(rule.value)
            .push_bind(rule.max_upto)
            .push_bind(rule.direction)
            .push_bind(rule.amount)
            .push_bind(rule.taxable);
    });
    qb.build()
        .execute(conn)
        .await
        .map_err(db_error("Failed to insert applied rules"))?;
    Ok(())
}

async fn replace_summaries(
    conn: &mut PgConnection,
    bill_id: Uuid,
    rows: &[BillSummary],
) -> AppResult<()> {
    sqlx::query("DELETE FROM bill_summaries WHERE bill_id = $1")
        .bind(bill_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to clear bill summaries"))?;

    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO bill_summaries (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            bill_id, position, title, amount, currency
        ) "#,
    );
    qb.push_values(rows, |mut row, summary| {
        row.push_bind(summary.audit.id)
            .push_bind(summary.audit.version)
            .push_bind(summary.audit.tenant_id)
            .push_bind(summary.audit.created_on)
            .push_bind(summary.audit.updated_on)
            .push_bind(summary.audit.created_by)
            .push_bind(summary.audit.updated_by)
            .push_bind(summary.bill_id)
            .push_bind(summary.position)
            .push_bind(summary.title.clone())
            .push_bind(summary.amount)
            .push_bind(summary.currency.clone());
    });
    qb.build()
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to insert bill summaries"))?;
    Ok(())
}

/// Optimistic write of a bill payment plan whose envelope was already bumped.
pub(super) async fn write_bill_payment_plan<'e, E: PgExecutor<'e>>(
    executor: E,
    plan: &BillPaymentPlan,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bill_payment_plans
        SET paid_amount = $3, installments_paid = $4, last_charged_on = $5, active = $6,
            consent_response = $7, version = $8, updated_on = $9, updated_by = $10
        WHERE tenant_id = $1 AND id = $2 AND version = $8 - 1
        "#,
    )
    .bind(plan.audit.tenant_id)
    .bind(plan.audit.id)
    .bind(plan.paid_amount)
    .bind(plan.installments_paid)
    .bind(plan.last_charged_on)
    .bind(plan.active)
    .bind(&plan.consent_response)
    .bind(plan.audit.version)
    .bind(plan.audit.updated_on)
    .bind(plan.audit.updated_by)
    .execute(executor)
    .await
    .map_err(db_error("Failed to update bill payment plan"))?;

    crate::db::ensure_written(result.rows_affected(), "bill payment plan")
}

#[async_trait]
impl BillingStore for PgBillingRepository {
    #[tracing::instrument(skip(self), fields(db.table = "tax_per_state", db.operation = "select"))]
    async fn tax_rules(&self, tenant_id: Uuid, state: &str) -> AppResult<Vec<TaxPerState>> {
        let rules = sqlx::query_as::<Postgres, TaxPerState>(
            r#"
            SELECT * FROM tax_per_state
            WHERE tenant_id = $1 AND state = $2 AND deleted_by IS NULL
            ORDER BY start_date DESC NULLS LAST
            "#,
        )
        .bind(tenant_id)
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load state tax rules"))?;

        Ok(rules)
    }

    #[tracing::instrument(skip(self, aggregate), fields(db.table = "bills", db.operation = "save", bill_id = %aggregate.bill.id()))]
    async fn save_bill(&self, aggregate: &BillAggregate, replace: bool) -> AppResult<Bill> {
        let mut tx = begin_serializable(&self.pool).await?;
        let bill_id = aggregate.bill.id();

        let saved = if replace {
            let saved = write_bill(&mut *tx, &aggregate.bill).await?;
            sqlx::query("DELETE FROM applied_rules WHERE bill_id = $1")
                .bind(bill_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to clear applied rules"))?;
            sqlx::query("DELETE FROM bill_breakdowns WHERE bill_id = $1")
                .bind(bill_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to clear bill breakdowns"))?;
            saved
        } else {
            insert_bill(&mut *tx, &aggregate.bill).await?
        };

        insert_breakdowns(&mut tx, &aggregate.breakdowns).await?;
        insert_applied_rules(&mut tx, &aggregate.applied).await?;
        replace_summaries(&mut tx, bill_id, &aggregate.summaries).await?;

        commit(tx).await?;

        tracing::info!(
            bill_id = %bill_id,
            display_id = %saved.display_id,
            patient_amount = %saved.patient_amount,
            lines = aggregate.breakdowns.len(),
            recalculated = replace,
            "Bill saved"
        );

        Ok(saved)
    }

    #[tracing::instrument(skip(self, ctx), fields(db.table = "bills", db.operation = "select"))]
    async fn get_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Option<Bill>> {
        let mut qb = scoped_select::<Bill>(ctx);
        qb.push(" AND bills.id = ");
        qb.push_bind(bill_id);

        let bill = qb
            .build_query_as::<Bill>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get bill"))?;

        Ok(bill)
    }

    #[tracing::instrument(skip(self), fields(db.table = "bills", db.operation = "select"))]
    async fn get_bill_aggregate(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillAggregate>> {
        let bill = sqlx::query_as::<Postgres, Bill>(
            "SELECT * FROM bills WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get bill"))?;

        let Some(bill) = bill else {
            return Ok(None);
        };

        let breakdowns = sqlx::query_as::<Postgres, BillBreakDown>(
            "SELECT * FROM bill_breakdowns WHERE bill_id = $1 ORDER BY position",
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load bill breakdowns"))?;

        let applied = sqlx::query_as::<Postgres, AppliedRule>(
            "SELECT * FROM applied_rules WHERE bill_id = $1 ORDER BY breakdown_id NULLS LAST, created_on",
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load applied rules"))?;

        let summaries = sqlx::query_as::<Postgres, BillSummary>(
            "SELECT * FROM bill_summaries WHERE bill_id = $1 ORDER BY position",
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load bill summaries"))?;

        Ok(Some(BillAggregate {
            bill,
            breakdowns,
            applied,
            summaries,
        }))
    }

    #[tracing::instrument(skip(self, bill), fields(db.table = "bills", db.operation = "update", bill_id = %bill.id()))]
    async fn update_bill(&self, bill: &Bill) -> AppResult<Bill> {
        let updated = write_bill(&self.pool, bill).await?;
        tracing::info!(bill_id = %updated.id(), status = ?updated.status, "Bill updated");
        Ok(updated)
    }

    #[tracing::instrument(skip(self), fields(db.table = "payment_plans", db.operation = "select"))]
    async fn get_payment_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> AppResult<Option<PaymentPlan>> {
        let plan = sqlx::query_as::<Postgres, PaymentPlan>(
            "SELECT * FROM payment_plans WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment plan"))?;

        Ok(plan)
    }

    #[tracing::instrument(skip(self), fields(db.table = "bill_payment_plans", db.operation = "select"))]
    async fn get_bill_payment_plan(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillPaymentPlan>> {
        let plan = sqlx::query_as::<Postgres, BillPaymentPlan>(
            r#"
            SELECT * FROM bill_payment_plans
            WHERE tenant_id = $1 AND bill_id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get bill payment plan"))?;

        Ok(plan)
    }

    #[tracing::instrument(skip(self, plan, bill, summaries), fields(db.table = "bill_payment_plans", db.operation = "insert", bill_id = %bill.id()))]
    async fn attach_payment_plan(
        &self,
        plan: &BillPaymentPlan,
        bill: &Bill,
        summaries: &[BillSummary],
    ) -> AppResult<BillPaymentPlan> {
        let mut tx = begin_serializable(&self.pool).await?;

        let attached = sqlx::query_as::<Postgres, BillPaymentPlan>(
            r#"
            INSERT INTO bill_payment_plans (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                bill_id, payment_plan_id, duration, interest_rate, type_of_interest, fees,
                interest_amount, tax, payable_amount_using_pp, emi, paid_amount,
                installments_paid, start_date, day_of_month, consent_id, payment_method,
                consent_response, last_charged_on, active
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26
            )
            RETURNING *
            "#,
        )
        .bind(plan.audit.id)
        .bind(plan.audit.version)
        .bind(plan.audit.tenant_id)
        .bind(plan.audit.created_on)
        .bind(plan.audit.updated_on)
        .bind(plan.audit.created_by)
        .bind(plan.audit.updated_by)
        .bind(plan.bill_id)
        .bind(plan.payment_plan_id)
        .bind(plan.duration)
        .bind(plan.interest_rate)
        .bind(plan.type_of_interest)
        .bind(plan.fees)
        .bind(plan.interest_amount)
        .bind(plan.tax)
        .bind(plan.payable_amount_using_pp)
        .bind(plan.emi)
        .bind(plan.paid_amount)
        .bind(plan.installments_paid)
        .bind(plan.start_date)
        .bind(plan.day_of_month)
        .bind(&plan.consent_id)
        .bind(plan.payment_method)
        .bind(&plan.consent_response)
        .bind(plan.last_charged_on)
        .bind(plan.active)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to attach payment plan"))?;

        write_bill(&mut *tx, bill).await?;
        replace_summaries(&mut tx, bill.id(), summaries).await?;

        commit(tx).await?;

        tracing::info!(
            bill_id = %bill.id(),
            duration = attached.duration,
            emi = %attached.emi,
            "Payment plan attached to bill"
        );

        Ok(attached)
    }

    #[tracing::instrument(skip(self, plan), fields(db.table = "bill_payment_plans", db.operation = "update"))]
    async fn update_bill_payment_plan(&self, plan: &BillPaymentPlan) -> AppResult<()> {
        write_bill_payment_plan(&self.pool, plan).await
    }

    #[tracing::instrument(skip(self), fields(db.table = "bill_payment_plans", db.operation = "select"))]
    async fn active_bill_payment_plans(&self) -> AppResult<Vec<BillPaymentPlan>> {
        let plans = sqlx::query_as::<Postgres, BillPaymentPlan>(
            r#"
            SELECT * FROM bill_payment_plans
            WHERE active AND installments_paid < duration AND deleted_by IS NULL
            ORDER BY tenant_id, start_date
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list active payment plans"))?;

        Ok(plans)
    }
}
