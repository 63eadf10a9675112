//! Payment plans: consent at enrolment, then monthly charges against the consent.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use keystone_core::billing::plan::{
    credit_installment, installment_amount, next_due_date, upcoming_emis, InstallmentCredit,
};
use keystone_core::billing::{compute_plan, SummaryRow, TaxRule};
use keystone_core::models::{
    AuditEnvelope, Bill, BillPaymentPlan, BillStatus, GatewayEvent, NotificationTemplate,
    PayRequest, Payment, PaymentPlanKind, PaymentStatus,
};
use keystone_core::payments::status_after_sale;
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{BillingStore, PaymentStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::billing::summary_rows;
use crate::clock::Clock;
use crate::gateway::{ConsentTerms, GatewayExchange, PaymentGateway};
use crate::notifier::Notifier;
use crate::payment::{new_payment, transaction_log, Instrument, InstrumentVault, Settlement};

/// Titles appended to a bill's summary once it is on a plan.
const PLAN_ROW_TITLES: [&str; 3] = ["Payment Plan Fees", "Interest Amount", "Payment Plan Tax"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallmentReport {
    pub due: usize,
    pub charged: usize,
    pub failed: usize,
    pub deferred: usize,
    pub completed_plans: usize,
}

#[derive(Clone)]
pub struct PlanManager {
    bills: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    vault: InstrumentVault,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    settlement: Settlement,
}

impl PlanManager {
    pub fn new(
        bills: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        vault: InstrumentVault,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settlement = Settlement::new(bills.clone(), payments.clone(), clock.clone());
        Self {
            bills,
            payments,
            gateway,
            vault,
            notifier,
            clock,
            settlement,
        }
    }

    async fn log_exchange(
        &self,
        ctx: &RequestContext,
        payment_id: Option<Uuid>,
        event: GatewayEvent,
        exchange: &GatewayExchange,
        success: bool,
    ) {
        let source = if ctx.is_system() {
            keystone_core::models::EventSource::System
        } else {
            keystone_core::models::EventSource::Gateway
        };
        let log = transaction_log(ctx, payment_id, event, source, exchange, success, self.clock.now());
        if let Err(e) = self.payments.log_transaction(&log).await {
            tracing::warn!(error = %e, event = ?event, "Failed to write transaction log");
        }
    }

    /// Enrol a bill in a payment plan. `req.installment_date` is the first due date.
    #[tracing::instrument(skip(self, ctx, req), fields(tenant_id = %ctx.tenant_id))]
    pub async fn process_consent(
        &self,
        ctx: &RequestContext,
        bill_id: Uuid,
        req: &PayRequest,
    ) -> AppResult<BillPaymentPlan> {
        let plan_id = req
            .payment_plan_id
            .ok_or_else(|| AppError::MissingRequiredParam("payment_plan_id".to_string()))?;
        let mut bill = self
            .bills
            .get_bill(ctx, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bill_id)))?;
        if bill.balance_due() <= rust_decimal::Decimal::ZERO {
            return Err(AppError::PaymentDone);
        }
        if !bill.status.is_payable() {
            return Err(AppError::InvalidStatus(format!(
                "bill in status {:?} cannot move to a payment plan",
                bill.status
            )));
        }
        if self
            .bills
            .get_bill_payment_plan(ctx.tenant_id, bill_id)
            .await?
            .is_some_and(|p| p.active)
        {
            return Err(AppError::InvalidStatus(
                "bill already has an active payment plan".to_string(),
            ));
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let plan = self
            .bills
            .get_payment_plan(ctx.tenant_id, plan_id)
            .await?
            .filter(|p| p.is_offered_on(today))
            .ok_or_else(|| AppError::NotFound(format!("payment plan {}", plan_id)))?;

        let start_date = req.installment_date.unwrap_or(today);
        if start_date < today {
            return Err(AppError::InvalidInput(
                "installment_date must not be in the past".to_string(),
            ));
        }

        let rules = match bill.tax_state.as_deref() {
            Some(state) => self.bills.tax_rules(ctx.tenant_id, state).await?,
            None => Vec::new(),
        };
        let tax = TaxRule::for_state(&rules, bill.tax_state.as_deref(), bill.service_date);
        let figures = compute_plan(&plan, bill.balance_due(), &tax)?;

        let instrument = self.vault.resolve(ctx.tenant_id, bill.resident_id, req).await?;
        let consent = match &instrument {
            Instrument::Card { card, cvv, .. } => {
                let terms = ConsentTerms {
                    full_amount: figures.payable_amount_using_pp,
                    emi_amount: figures.emi,
                    consent_days: figures.consent_days(),
                    start_date,
                };
                self.gateway.create_consent_card(&terms, card, cvv).await?
            }
            Instrument::Account { account, .. } => {
                self.gateway.create_consent_account(account).await?
            }
        };
        self.log_exchange(ctx, None, GatewayEvent::ConsentGateway, &consent.exchange, consent.success)
            .await;
        let consent_id = match (consent.success, consent.transaction_id.clone()) {
            (true, Some(id)) => id,
            _ => {
                return Err(AppError::Gateway(
                    consent.error.unwrap_or_else(|| "consent rejected".to_string()),
                ))
            }
        };

        let bpp = BillPaymentPlan {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            bill_id,
            payment_plan_id: plan_id,
            duration: figures.duration,
            interest_rate: plan.interest_rate,
            type_of_interest: plan.type_of_interest,
            fees: figures.fees,
            interest_amount: figures.interest_amount,
            tax: figures.tax(),
            payable_amount_using_pp: figures.payable_amount_using_pp,
            emi: figures.emi,
            paid_amount: rust_decimal::Decimal::ZERO,
            installments_paid: 0,
            start_date,
            day_of_month: start_date.day() as i16,
            consent_id,
            payment_method: req.payment_method,
            consent_response: consent.data.clone(),
            last_charged_on: None,
            active: true,
        };

        let mut rows: Vec<SummaryRow> = self
            .bills
            .get_bill_aggregate(ctx.tenant_id, bill_id)
            .await?
            .map(|a| a.summaries)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !PLAN_ROW_TITLES.contains(&s.title.as_str()))
            .map(|s| SummaryRow {
                title: s.title,
                amount: s.amount,
            })
            .collect();
        rows.extend(
            PLAN_ROW_TITLES
                .iter()
                .zip([figures.fees, figures.interest_amount, figures.tax()])
                .map(|(title, amount)| SummaryRow {
                    title: title.to_string(),
                    amount,
                }),
        );
        let summaries = summary_rows(ctx, now, bill_id, &bill.currency, rows);

        bill.status = BillStatus::OnPp;
        bill.audit.stamp_update(ctx);
        let saved = self.bills.attach_payment_plan(&bpp, &bill, &summaries).await?;

        if req.save_method {
            if let Err(e) = self
                .vault
                .remember(ctx, bill.resident_id, &instrument, req.make_primary, now)
                .await
            {
                tracing::warn!(error = %e, "Failed to save payment instrument");
            }
        }

        tracing::info!(
            bill_id = %bill_id,
            duration = saved.duration,
            emi = %saved.emi,
            payable = %saved.payable_amount_using_pp,
            "Bill moved to payment plan"
        );
        Ok(saved)
    }

    pub async fn upcoming(&self, ctx: &RequestContext, bill_id: Uuid, n: usize) -> AppResult<Vec<NaiveDate>> {
        let bpp = self
            .bills
            .get_bill_payment_plan(ctx.tenant_id, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment plan for bill {}", bill_id)))?;
        Ok(upcoming_emis(&bpp, n))
    }

    /// Charge every plan whose next installment is due on or before `today`. A plan is
    /// charged at most once per day.
    #[tracing::instrument(skip(self))]
    pub async fn run_installments(&self, today: NaiveDate) -> AppResult<InstallmentReport> {
        let mut report = InstallmentReport::default();
        for bpp in self.bills.active_bill_payment_plans().await? {
            let Some(due) = next_due_date(&bpp) else {
                continue;
            };
            let charged_today = bpp
                .last_charged_on
                .is_some_and(|t| t.date_naive() >= today);
            if due > today || charged_today {
                continue;
            }
            report.due += 1;
            let plan_id = bpp.audit.id;
            match self.process_installment(bpp, due).await {
                Ok(InstallmentOutcome::Charged { completed }) => {
                    report.charged += 1;
                    if completed {
                        report.completed_plans += 1;
                    }
                }
                Ok(InstallmentOutcome::Declined) => report.failed += 1,
                Ok(InstallmentOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    tracing::error!(error = %e, bill_payment_plan_id = %plan_id, "Installment run failed");
                    report.failed += 1;
                }
            }
        }
        if report.due > 0 {
            tracing::info!(
                due = report.due,
                charged = report.charged,
                failed = report.failed,
                deferred = report.deferred,
                "Installments processed"
            );
        }
        Ok(report)
    }

    /// Follow up on an earlier charge of the same installment that is still unresolved;
    /// otherwise charge it.
    async fn process_installment(
        &self,
        bpp: BillPaymentPlan,
        due: NaiveDate,
    ) -> AppResult<InstallmentOutcome> {
        let number = bpp.installments_paid + 1;
        let outstanding = self
            .payments
            .payments_for_bill(bpp.audit.tenant_id, bpp.bill_id)
            .await?
            .into_iter()
            .find(|p| {
                p.payment_plan == PaymentPlanKind::Monthly
                    && p.payment_term == Some(number)
                    && !p.status.is_final()
            });
        match outstanding {
            Some(payment) => self.follow_up(payment).await,
            None => self.charge_installment(bpp, due).await,
        }
    }

    async fn follow_up(&self, payment: Payment) -> AppResult<InstallmentOutcome> {
        let ctx = RequestContext::system(payment.audit.tenant_id);
        let payment_id = payment.id();
        let query = match self
            .gateway
            .query_transaction(payment.transaction_id.as_deref(), payment.method, payment_id)
            .await
        {
            Ok(query) => query,
            Err(AppError::Gateway(reason)) => {
                tracing::warn!(payment_id = %payment_id, reason = %reason, "Installment still awaiting the gateway");
                return Ok(InstallmentOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };
        self.log_exchange(&ctx, Some(payment_id), GatewayEvent::QueryGateway, &query.exchange, query.transaction.is_some())
            .await;
        let Some(found) = query.transaction else {
            return Ok(InstallmentOutcome::Deferred);
        };

        let bill_id = payment.bill_id;
        let status = self
            .settlement
            .apply_gateway_status(&ctx, payment, found.status, Some(found.transaction_id))
            .await?;
        match status {
            Some(PaymentStatus::Completed) => {
                let completed = self
                    .bills
                    .get_bill_payment_plan(ctx.tenant_id, bill_id)
                    .await?
                    .is_some_and(|p| !p.active);
                Ok(InstallmentOutcome::Charged { completed })
            }
            Some(PaymentStatus::Failed) => Ok(InstallmentOutcome::Declined),
            _ => Ok(InstallmentOutcome::Deferred),
        }
    }

    async fn charge_installment(
        &self,
        mut bpp: BillPaymentPlan,
        due: NaiveDate,
    ) -> AppResult<InstallmentOutcome> {
        let ctx = RequestContext::system(bpp.audit.tenant_id);
        let now = self.clock.now();
        let mut bill: Bill = self
            .bills
            .get_bill_aggregate(ctx.tenant_id, bpp.bill_id)
            .await?
            .map(|a| a.bill)
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bpp.bill_id)))?;

        let number = bpp.installments_paid + 1;
        let amount = installment_amount(&bpp, number);
        let mut payment = new_payment(&ctx, &bill, amount, bpp.payment_method, PaymentPlanKind::Monthly, now);
        payment.installment_date = Some(due);
        payment.payment_term = Some(number);
        let mut payment = self.payments.insert_payment(&payment).await?;

        let charge = if bpp.payment_method.is_card() {
            self.gateway
                .charge_consent_card(&bpp.consent_id, &payment.order_id, amount)
                .await
        } else {
            self.gateway
                .charge_consent_account(&bpp.consent_id, &payment.order_id, amount)
                .await
        };
        let charge = match charge {
            Ok(charge) => charge,
            Err(AppError::Gateway(reason)) => {
                tracing::warn!(payment_id = %payment.id(), reason = %reason, "Installment charge left pending");
                bpp.last_charged_on = Some(now);
                bpp.audit.stamp_update(&ctx);
                self.bills.update_bill_payment_plan(&bpp).await?;
                return Ok(InstallmentOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };
        self.log_exchange(&ctx, Some(payment.id()), GatewayEvent::SaleGateway, &charge.exchange, charge.success)
            .await;

        let (status, gateway_status) = status_after_sale(charge.success, bpp.payment_method);
        payment.status = status;
        payment.gateway_status = Some(gateway_status);
        payment.transaction_id = charge.transaction_id.clone();
        payment.processed_on = charge.success.then_some(now);
        payment.audit.stamp_update(&ctx);
        bpp.last_charged_on = Some(now);

        // An ACH charge stays IN_PROCESS until the reconciler sees it settle.
        let completed = status == PaymentStatus::Completed
            && credit_installment(&mut bpp, &mut bill, number, amount, now.date_naive())
                == InstallmentCredit::PlanCompleted;
        bill.audit.stamp_update(&ctx);
        bpp.audit.stamp_update(&ctx);
        self.payments.settle_installment(&payment, &bill, &bpp).await?;

        if !charge.success {
            self.notifier
                .notify_resident(
                    &ctx,
                    bill.resident_id,
                    NotificationTemplate::InstallmentFailed,
                    json!({
                        "bill_id": bill.id(),
                        "display_id": bill.display_id,
                        "installment": number,
                        "amount": amount,
                        "due_date": due,
                        "reason": charge.error,
                    }),
                )
                .await;
            return Ok(InstallmentOutcome::Declined);
        }
        Ok(InstallmentOutcome::Charged { completed })
    }
}

enum InstallmentOutcome {
    Charged { completed: bool },
    Declined,
    Deferred,
}
