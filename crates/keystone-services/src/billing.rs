//! Bill creation, recalculation and cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keystone_core::billing::{
    bill as bill_rules, build_summary, calculate_bill, calculate_line, AppliedAmount,
    LineCalculation, SummaryRow, TaxRule,
};
use keystone_core::constants::DEFAULT_CURRENCY;
use keystone_core::models::{
    AppliedRule, AuditEnvelope, Bill, BillAggregate, BillBreakDown, BillInput, BillStatus,
    BillSummary,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{BillingStore, LookupStore, TenantStore};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::clock::Clock;

#[derive(Clone)]
pub struct BillingService {
    tenants: Arc<dyn TenantStore>,
    bills: Arc<dyn BillingStore>,
    lookups: Arc<dyn LookupStore>,
    clock: Arc<dyn Clock>,
}

fn display_id(id: Uuid, now: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!("BL-{}-{}", now.format("%Y%m%d"), simple[..8].to_uppercase())
}

fn applied_rule(
    ctx: &RequestContext,
    now: DateTime<Utc>,
    bill_id: Uuid,
    breakdown_id: Option<Uuid>,
    applied: &AppliedAmount,
) -> AppliedRule {
    AppliedRule {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        bill_id,
        breakdown_id,
        kind: applied.kind,
        name: applied.spec.name.clone(),
        rule_type: applied.spec.rule_type,
        value: applied.spec.value,
        max_upto: applied.spec.max_upto,
        direction: applied.spec.direction,
        amount: applied.amount,
        taxable: applied.spec.taxable,
    }
}

pub(crate) fn summary_rows(
    ctx: &RequestContext,
    now: DateTime<Utc>,
    bill_id: Uuid,
    currency: &str,
    rows: Vec<SummaryRow>,
) -> Vec<BillSummary> {
    rows.into_iter()
        .enumerate()
        .map(|(position, row)| BillSummary {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            bill_id,
            position: position as i32,
            title: row.title,
            amount: row.amount,
            currency: currency.to_string(),
        })
        .collect()
}

impl BillingService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        bills: Arc<dyn BillingStore>,
        lookups: Arc<dyn LookupStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tenants,
            bills,
            lookups,
            clock,
        }
    }

    pub async fn tax_rule(&self, tenant_id: Uuid, bill: &Bill) -> AppResult<TaxRule> {
        let rules = match bill.tax_state.as_deref() {
            Some(state) => self.bills.tax_rules(tenant_id, state).await?,
            None => Vec::new(),
        };
        Ok(TaxRule::for_state(
            &rules,
            bill.tax_state.as_deref(),
            bill.service_date,
        ))
    }

    async fn currency(&self, tenant_id: Uuid) -> AppResult<String> {
        Ok(self
            .tenants
            .get_tenant(tenant_id)
            .await?
            .map(|t| t.default_currency)
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()))
    }

    /// Price every line, roll up the bill and rebuild all child rows.
    async fn price(
        &self,
        ctx: &RequestContext,
        mut bill: Bill,
        input: &BillInput,
    ) -> AppResult<BillAggregate> {
        if input.breakdown.is_empty() {
            return Err(AppError::MissingRequiredParam("breakdown".to_string()));
        }
        if input.due_date < input.statement_date {
            return Err(AppError::InvalidInput(
                "due_date must not be before statement_date".to_string(),
            ));
        }

        let tax = self.tax_rule(ctx.tenant_id, &bill).await?;
        let now = self.clock.now();
        let bill_id = bill.id();

        let mut priced: Vec<(String, LineCalculation)> = Vec::with_capacity(input.breakdown.len());
        for line in &input.breakdown {
            priced.push((line.category.clone(), calculate_line(line, &tax)?));
        }
        let lines: Vec<LineCalculation> = priced.iter().map(|(_, l)| l.clone()).collect();
        let totals = calculate_bill(
            &lines,
            &input.adjustments,
            &input.discounts,
            &input.writeoffs,
            &tax,
        );
        bill_rules::apply_totals(&mut bill, &totals);

        let mut breakdowns = Vec::with_capacity(priced.len());
        let mut applied = Vec::new();
        for (position, (line, (_, calc))) in input.breakdown.iter().zip(&priced).enumerate() {
            let row = BillBreakDown {
                audit: AuditEnvelope::stamp_create_at(ctx, now),
                bill_id,
                position: position as i32,
                category: line.category.clone(),
                type_of_service: line.type_of_service.clone(),
                description: line.description.clone(),
                quantity: line.quantity,
                type_of_service_amount: line.unit_amount,
                service_taxable: line.service_taxable,
                other_fees: calc.other_fees,
                other_fees_taxable: line.other_fees_taxable,
                insurance_amount: calc.insurance_amount,
                sub_total: calc.sub_total,
                taxable_amount: calc.taxable_amount,
                tax: calc.tax,
                total_amount: calc.total_amount,
                patient_amount: calc.patient_amount,
                currency: line.currency.clone().unwrap_or_else(|| bill.currency.clone()),
                service_start_date: line.service_start_date,
                service_end_date: line.service_end_date,
            };
            applied.extend(
                calc.applied
                    .iter()
                    .map(|a| applied_rule(ctx, now, bill_id, Some(row.audit.id), a)),
            );
            breakdowns.push(row);
        }
        applied.extend(
            totals
                .applied
                .iter()
                .map(|a| applied_rule(ctx, now, bill_id, None, a)),
        );

        let summaries = summary_rows(
            ctx,
            now,
            bill_id,
            &bill.currency,
            build_summary(&priced, &totals, None),
        );

        Ok(BillAggregate {
            bill,
            breakdowns,
            applied,
            summaries,
        })
    }

    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create(&self, ctx: &RequestContext, input: &BillInput) -> AppResult<BillAggregate> {
        let now = self.clock.now();
        let audit = AuditEnvelope::stamp_create_at(ctx, now);
        let bill = Bill {
            display_id: display_id(audit.id, now),
            audit,
            resident_id: input.resident_id,
            location_id: input.location_id,
            service_description: input.service_description.clone(),
            service_date: input.service_date,
            statement_date: input.statement_date,
            due_date: input.due_date,
            paid_date: None,
            status: BillStatus::Pending,
            currency: self.currency(ctx.tenant_id).await?,
            tax_state: input.tax_state.clone(),
            total_charges: Decimal::ZERO,
            insurance_paid: Decimal::ZERO,
            patient_amount: Decimal::ZERO,
            other_discount: Decimal::ZERO,
            other_adjustment: Decimal::ZERO,
            other_writeoff: Decimal::ZERO,
            other_tax: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            cancellation_reason: None,
            cancellation_code: None,
        };

        let mut aggregate = self.price(ctx, bill, input).await?;
        aggregate.bill = self.bills.save_bill(&aggregate, false).await?;
        Ok(aggregate)
    }

    /// Recalculate a bill from scratch. Only PENDING bills with nothing collected qualify.
    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        bill_id: Uuid,
        input: &BillInput,
    ) -> AppResult<BillAggregate> {
        let mut bill = self.visible_bill(ctx, bill_id).await?;
        bill_rules::ensure_editable(&bill)?;
        if bill.resident_id != input.resident_id {
            return Err(AppError::InvalidInput(
                "a bill cannot be moved to another resident".to_string(),
            ));
        }

        bill.location_id = input.location_id;
        bill.service_description = input.service_description.clone();
        bill.service_date = input.service_date;
        bill.statement_date = input.statement_date;
        bill.due_date = input.due_date;
        bill.tax_state = input.tax_state.clone();
        bill.audit.stamp_update(ctx);

        let mut aggregate = self.price(ctx, bill, input).await?;
        aggregate.bill = self.bills.save_bill(&aggregate, true).await?;
        Ok(aggregate)
    }

    pub async fn visible_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Bill> {
        self.bills
            .get_bill(ctx, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bill_id)))
    }

    pub async fn get(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<BillAggregate> {
        self.visible_bill(ctx, bill_id).await?;
        self.bills
            .get_bill_aggregate(ctx.tenant_id, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bill_id)))
    }

    /// Cancel a PENDING bill; the reason must map to a configured cancellation code.
    pub async fn cancel(&self, ctx: &RequestContext, bill_id: Uuid, reason: &str) -> AppResult<Bill> {
        let mut bill = self.visible_bill(ctx, bill_id).await?;
        let code = self
            .lookups
            .cancellation_code(ctx.tenant_id, reason.trim())
            .await?
            .map(|c| c.cancellation_code);
        bill_rules::cancel(&mut bill, reason.trim(), code)?;
        bill.audit.stamp_update(ctx);
        let cancelled = self.bills.update_bill(&bill).await?;

        tracing::info!(
            bill_id = %bill_id,
            tenant_id = %ctx.tenant_id,
            cancellation_code = ?cancelled.cancellation_code,
            "Bill cancelled"
        );
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_id_is_dated_and_short() {
        let now = DateTime::parse_from_rfc3339("2025-03-04T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = display_id(Uuid::new_v4(), now);
        assert!(id.starts_with("BL-20250304-"));
        assert_eq!(id.len(), "BL-20250304-".len() + 8);
    }
}
