//! Bill payments through the gateway
//!
//! A payment row is written PENDING before the processor is called so that a timed-out
//! sale is never lost: the reconciler later resolves it with `query_transaction`. Card and
//! account numbers only ever leave this module encrypted (saved instruments) or redacted
//! (transaction log).

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use keystone_core::billing::bill as bill_rules;
use keystone_core::billing::plan as plan_rules;
use keystone_core::encryption::{last_four, redact_json};
use keystone_core::models::{
    AccountDetails, AuditEnvelope, Bill, BillStatus, CardDetails, EventSource, GatewayEvent,
    GatewayReconState, GatewayStatus, NotificationTemplate, PayRequest, PayResponse, Payment,
    PaymentMethod, PaymentPlanKind, PaymentStatus, SavedAccount, SavedCard, TransactionLog,
    TransactionType,
};
use keystone_core::payments::{ensure_transition, status_after_sale, status_from_gateway};
use keystone_core::{AppError, AppResult, EncryptionService, GatewaySettings, RequestContext};
use keystone_db::{BillingStore, PaymentStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::gateway::{valid_cvv, GatewayExchange, PaymentGateway, ReconcileQuery};
use crate::notifier::Notifier;

/// A payment instrument resolved from a request.
#[derive(Debug, Clone)]
pub enum Instrument {
    Card {
        card: CardDetails,
        cvv: String,
        /// True when it came from a new card in the request rather than a saved one.
        fresh: bool,
    },
    Account {
        account: AccountDetails,
        fresh: bool,
    },
}

/// Resolves saved instruments and stores new ones encrypted.
#[derive(Clone)]
pub struct InstrumentVault {
    payments: Arc<dyn PaymentStore>,
    encryption: EncryptionService,
}

impl InstrumentVault {
    pub fn new(payments: Arc<dyn PaymentStore>, encryption: EncryptionService) -> Self {
        Self {
            payments,
            encryption,
        }
    }

    /// Card or account for `req`, owned by `resident_id`.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        resident_id: Uuid,
        req: &PayRequest,
    ) -> AppResult<Instrument> {
        if req.payment_method.is_card() {
            let cvv = req.cvv.clone().unwrap_or_default();
            if !valid_cvv(&cvv) {
                return Err(AppError::InvalidCvv);
            }
            if let Some(card_id) = req.saved_card {
                let saved = self
                    .payments
                    .get_saved_card(tenant_id, card_id)
                    .await?
                    .filter(|c| c.resident_id == resident_id)
                    .ok_or_else(|| AppError::NotFound(format!("saved card {}", card_id)))?;
                let card = CardDetails {
                    number: self.encryption.decrypt(&saved.card_encrypted)?,
                    expiry_month: saved.expiry_month,
                    expiry_year: saved.expiry_year,
                    holder_name: saved.holder_name,
                    brand: saved.brand,
                };
                return Ok(Instrument::Card {
                    card,
                    cvv,
                    fresh: false,
                });
            }
            let card = req.card.clone().ok_or(AppError::CardMissingPayment)?;
            return Ok(Instrument::Card {
                card,
                cvv,
                fresh: true,
            });
        }

        if req.payment_method == PaymentMethod::BankTransfer {
            if let Some(account_id) = req.saved_account {
                let saved = self
                    .payments
                    .get_saved_account(tenant_id, account_id)
                    .await?
                    .filter(|a| a.resident_id == resident_id)
                    .ok_or_else(|| AppError::NotFound(format!("saved account {}", account_id)))?;
                let account = AccountDetails {
                    account_number: self.encryption.decrypt(&saved.account_encrypted)?,
                    routing_number: self.encryption.decrypt(&saved.routing_encrypted)?,
                    account_type: saved.account_type,
                    holder_name: saved.holder_name,
                };
                return Ok(Instrument::Account {
                    account,
                    fresh: false,
                });
            }
            let account = req.account.clone().ok_or(AppError::AccountMissingPayment)?;
            return Ok(Instrument::Account {
                account,
                fresh: true,
            });
        }

        Err(AppError::InvalidPaymentMethod(format!(
            "{:?} has no card or account instrument",
            req.payment_method
        )))
    }

    /// Save a fresh instrument for the resident. Saved ones are left alone.
    pub async fn remember(
        &self,
        ctx: &RequestContext,
        resident_id: Uuid,
        instrument: &Instrument,
        primary: bool,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        match instrument {
            Instrument::Card {
                card, fresh: true, ..
            } => {
                let saved = SavedCard {
                    audit: AuditEnvelope::stamp_create_at(ctx, now),
                    resident_id,
                    card_encrypted: self.encryption.encrypt(&card.number)?,
                    last_four: last_four(&card.number),
                    brand: card.brand.clone(),
                    expiry_month: card.expiry_month,
                    expiry_year: card.expiry_year,
                    holder_name: card.holder_name.clone(),
                    primary_method: primary,
                };
                self.payments.save_card(&saved).await?;
            }
            Instrument::Account {
                account,
                fresh: true,
            } => {
                let saved = SavedAccount {
                    audit: AuditEnvelope::stamp_create_at(ctx, now),
                    resident_id,
                    account_encrypted: self.encryption.encrypt(&account.account_number)?,
                    routing_encrypted: self.encryption.encrypt(&account.routing_number)?,
                    last_four: last_four(&account.account_number),
                    account_type: account.account_type.clone(),
                    holder_name: account.holder_name.clone(),
                    primary_method: primary,
                };
                self.payments.save_account(&saved).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Outcome of one reconciler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub resolved: usize,
    pub failed: usize,
    pub still_pending: usize,
}

/// Applies gateway-reported outcomes to a payment, its bill and, for installments, the
/// bill's payment plan.
#[derive(Clone)]
pub(crate) struct Settlement {
    bills: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentStore>,
    clock: Arc<dyn Clock>,
}

impl Settlement {
    pub(crate) fn new(
        bills: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bills,
            payments,
            clock,
        }
    }

    /// Returns the new status, or None when nothing changed.
    pub(crate) async fn apply_gateway_status(
        &self,
        ctx: &RequestContext,
        mut payment: Payment,
        gateway_status: GatewayStatus,
        transaction_id: Option<String>,
    ) -> AppResult<Option<PaymentStatus>> {
        let next = status_from_gateway(gateway_status, &payment);
        if next == payment.status && payment.gateway_status == Some(gateway_status) {
            return Ok(None);
        }
        ensure_transition(payment.status, next)?;

        let tenant_id = payment.audit.tenant_id;
        let mut bill = self
            .bills
            .get_bill_aggregate(tenant_id, payment.bill_id)
            .await?
            .map(|a| a.bill)
            .ok_or_else(|| AppError::NotFound(format!("bill {}", payment.bill_id)))?;
        let plan = match payment.payment_plan {
            PaymentPlanKind::Monthly => self.bills.get_bill_payment_plan(tenant_id, payment.bill_id).await?,
            _ => None,
        };

        let now = self.clock.now();
        let newly_completed = next == PaymentStatus::Completed && payment.status != PaymentStatus::Completed;
        payment.status = next;
        payment.gateway_status = Some(gateway_status);
        if payment.transaction_id.is_none() {
            payment.transaction_id = transaction_id;
        }
        if payment.processed_on.is_none() && next != PaymentStatus::Failed {
            payment.processed_on = Some(now);
        }
        payment.audit.stamp_update(ctx);

        match plan {
            Some(mut bpp) => {
                if newly_completed {
                    if let Some(number) = payment.payment_term {
                        let credit = plan_rules::credit_installment(
                            &mut bpp,
                            &mut bill,
                            number,
                            payment.amount,
                            now.date_naive(),
                        );
                        tracing::info!(
                            payment_id = %payment.id(),
                            installment = number,
                            credit = ?credit,
                            "Reconciled installment applied to payment plan"
                        );
                    }
                }
                bill.audit.stamp_update(ctx);
                bpp.audit.stamp_update(ctx);
                self.payments.settle_installment(&payment, &bill, &bpp).await?;
            }
            None => {
                if newly_completed {
                    bill_rules::record_payment(&mut bill, payment.amount, now.date_naive());
                }
                bill.audit.stamp_update(ctx);
                self.payments.settle_payment(&payment, &bill).await?;
            }
        }
        Ok(Some(next))
    }
}

/// A fresh PENDING payment row against `bill`.
pub(crate) fn new_payment(
    ctx: &RequestContext,
    bill: &Bill,
    amount: Decimal,
    method: PaymentMethod,
    plan: PaymentPlanKind,
    now: DateTime<Utc>,
) -> Payment {
    let audit = AuditEnvelope::stamp_create_at(ctx, now);
    Payment {
        order_id: audit.id.to_string(),
        audit,
        bill_id: bill.id(),
        parent_id: None,
        refund_request_id: None,
        transaction_type: TransactionType::Payment,
        amount,
        refund_amount: Decimal::ZERO,
        currency: bill.currency.clone(),
        method,
        status: PaymentStatus::Pending,
        gateway_status: None,
        transaction_id: None,
        extra_data: serde_json::Value::Null,
        installment_date: None,
        payment_term: None,
        payment_plan: plan,
        processed_on: None,
    }
}

/// Transaction log row with redacted bodies.
pub(crate) fn transaction_log(
    ctx: &RequestContext,
    payment_id: Option<Uuid>,
    event: GatewayEvent,
    source: EventSource,
    exchange: &GatewayExchange,
    success: bool,
    now: DateTime<Utc>,
) -> TransactionLog {
    TransactionLog {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        payment_id,
        event,
        event_source: source,
        request: redact_json(&exchange.request),
        response: redact_json(&exchange.response),
        success,
    }
}

#[derive(Clone)]
pub struct PaymentService {
    bills: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    vault: InstrumentVault,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    settings: GatewaySettings,
    settlement: Settlement,
}

impl PaymentService {
    pub fn new(
        bills: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        vault: InstrumentVault,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        settings: GatewaySettings,
    ) -> Self {
        let settlement = Settlement::new(bills.clone(), payments.clone(), clock.clone());
        Self {
            bills,
            payments,
            gateway,
            vault,
            notifier,
            clock,
            settings,
            settlement,
        }
    }

    pub(crate) async fn record_exchange(
        &self,
        ctx: &RequestContext,
        payment_id: Option<Uuid>,
        event: GatewayEvent,
        exchange: &GatewayExchange,
        success: bool,
    ) {
        let source = if ctx.is_system() {
            EventSource::System
        } else {
            EventSource::Gateway
        };
        let log = transaction_log(ctx, payment_id, event, source, exchange, success, self.clock.now());
        if let Err(e) = self.payments.log_transaction(&log).await {
            tracing::warn!(error = %e, payment_id = ?payment_id, event = ?event, "Failed to write transaction log");
        }
    }

    async fn visible_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Bill> {
        self.bills
            .get_bill(ctx, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bill_id)))
    }

    /// Pay all or part of a bill's balance.
    #[tracing::instrument(skip(self, ctx, req), fields(tenant_id = %ctx.tenant_id, method = ?req.payment_method))]
    pub async fn pay(&self, ctx: &RequestContext, bill_id: Uuid, req: &PayRequest) -> AppResult<PayResponse> {
        let mut bill = self.visible_bill(ctx, bill_id).await?;
        if bill.status == BillStatus::Completed || bill.balance_due() <= Decimal::ZERO {
            return Err(AppError::PaymentDone);
        }
        if !bill.status.is_payable() {
            return Err(AppError::InvalidStatus(format!(
                "bill in status {:?} does not accept payments",
                bill.status
            )));
        }

        let amount = req.amount.unwrap_or_else(|| bill.balance_due());
        if amount <= Decimal::ZERO || amount > bill.balance_due() {
            return Err(AppError::InvalidAmount(format!(
                "amount must be between 0 and the balance of {}",
                bill.balance_due()
            )));
        }

        let now = self.clock.now();
        match req.payment_method {
            PaymentMethod::Cash => self.pay_offline(ctx, bill, amount, now).await,
            PaymentMethod::PosPayment => {
                let payment = new_payment(ctx, &bill, amount, req.payment_method, PaymentPlanKind::Full, now);
                let mut payment = self.payments.insert_payment(&payment).await?;
                payment.extra_data = self
                    .gateway
                    .prepare_request_for_pos_payment(&payment, amount)
                    .await?;
                payment.audit.stamp_update(ctx);
                let payment = self.payments.update_payment(&payment).await?;
                Ok(PayResponse {
                    payment_id: Some(payment.id()),
                    status: payment.status,
                    extra_data: payment.extra_data,
                })
            }
            PaymentMethod::CreditCard | PaymentMethod::DebitCard | PaymentMethod::BankTransfer => {
                let instrument = self.vault.resolve(ctx.tenant_id, bill.resident_id, req).await?;
                let pending = new_payment(ctx, &bill, amount, req.payment_method, PaymentPlanKind::Full, now);
                let mut payment = self.payments.insert_payment(&pending).await?;

                let sale = match &instrument {
                    Instrument::Card { card, cvv, .. } => {
                        self.gateway.sale_card(&payment.order_id, amount, card, cvv).await
                    }
                    Instrument::Account { account, .. } => {
                        self.gateway.sale_account(&payment.order_id, amount, account).await
                    }
                };
                let sale = match sale {
                    Ok(sale) => sale,
                    Err(AppError::Gateway(reason)) => {
                        tracing::warn!(
                            payment_id = %payment.id(),
                            reason = %reason,
                            "Sale did not answer; leaving payment for the reconciler"
                        );
                        return Ok(PayResponse {
                            payment_id: Some(payment.id()),
                            status: PaymentStatus::Pending,
                            extra_data: serde_json::Value::Null,
                        });
                    }
                    Err(e) => return Err(e),
                };
                self.record_exchange(ctx, Some(payment.id()), GatewayEvent::SaleGateway, &sale.exchange, sale.success)
                    .await;

                let (status, gateway_status) = status_after_sale(sale.success, req.payment_method);
                payment.status = status;
                payment.gateway_status = Some(gateway_status);
                payment.transaction_id = sale.transaction_id.clone();
                payment.extra_data = sale.data.clone();
                payment.processed_on = sale.success.then_some(now);
                payment.audit.stamp_update(ctx);

                if status == PaymentStatus::Completed {
                    bill_rules::record_payment(&mut bill, amount, now.date_naive());
                } else if status == PaymentStatus::Failed && bill.paid_amount == Decimal::ZERO {
                    bill.status = BillStatus::Failed;
                }
                bill.audit.stamp_update(ctx);
                self.payments.settle_payment(&payment, &bill).await?;

                if sale.success && req.save_method {
                    if let Err(e) = self
                        .vault
                        .remember(ctx, bill.resident_id, &instrument, req.make_primary, now)
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to save payment instrument");
                    }
                }
                if status == PaymentStatus::Completed {
                    self.receipt(ctx, &bill, &payment).await;
                }
                if !sale.success {
                    tracing::info!(payment_id = %payment.id(), error = ?sale.error, "Sale declined");
                }

                Ok(PayResponse {
                    payment_id: Some(payment.id()),
                    status: payment.status,
                    extra_data: payment.extra_data,
                })
            }
            other => Err(AppError::InvalidPaymentMethod(format!(
                "{:?} cannot be used to pay a bill",
                other
            ))),
        }
    }

    async fn pay_offline(
        &self,
        ctx: &RequestContext,
        mut bill: Bill,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> AppResult<PayResponse> {
        if ctx.is_resident() {
            return Err(AppError::InvalidPaymentMethod(
                "cash payments are recorded by staff".to_string(),
            ));
        }
        let pending = new_payment(ctx, &bill, amount, PaymentMethod::Cash, PaymentPlanKind::Full, now);
        let mut payment = self.payments.insert_payment(&pending).await?;
        payment.status = PaymentStatus::Completed;
        payment.processed_on = Some(now);
        payment.audit.stamp_update(ctx);
        bill_rules::record_payment(&mut bill, amount, now.date_naive());
        bill.audit.stamp_update(ctx);
        self.payments.settle_payment(&payment, &bill).await?;
        self.receipt(ctx, &bill, &payment).await;
        Ok(PayResponse {
            payment_id: Some(payment.id()),
            status: payment.status,
            extra_data: serde_json::Value::Null,
        })
    }

    async fn receipt(&self, ctx: &RequestContext, bill: &Bill, payment: &Payment) {
        self.notifier
            .notify_resident(
                ctx,
                bill.resident_id,
                NotificationTemplate::PaymentReceipt,
                json!({
                    "bill_id": bill.id(),
                    "display_id": bill.display_id,
                    "payment_id": payment.id(),
                    "amount": payment.amount,
                    "currency": payment.currency,
                    "balance_due": bill.balance_due(),
                }),
            )
            .await;
    }

    /// Void the most recent payment on the bill whose gateway transaction is still OPEN.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn cancel_last(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Payment> {
        let mut bill = self.visible_bill(ctx, bill_id).await?;
        let mut payment = self
            .payments
            .payments_for_bill(ctx.tenant_id, bill_id)
            .await?
            .into_iter()
            .filter(|p| {
                p.transaction_type == TransactionType::Payment
                    && p.gateway_status == Some(GatewayStatus::Open)
                    && p.transaction_id.is_some()
                    && matches!(p.status, PaymentStatus::Completed | PaymentStatus::InProcess)
            })
            .max_by_key(|p| p.audit.created_on)
            .ok_or_else(|| {
                AppError::NoTransactionFound(format!("no open transaction on bill {}", bill_id))
            })?;

        let transaction_id = payment.transaction_id.clone().unwrap_or_default();
        let void = self
            .gateway
            .cancel_transaction(&transaction_id, payment.method)
            .await?;
        self.record_exchange(ctx, Some(payment.id()), GatewayEvent::VoidGateway, &void.exchange, void.success)
            .await;
        if !void.success {
            return Err(AppError::Gateway(
                void.error.unwrap_or_else(|| "void rejected".to_string()),
            ));
        }

        let was_counted = payment.status == PaymentStatus::Completed;
        ensure_transition(payment.status, PaymentStatus::Cancelled)?;
        payment.status = PaymentStatus::Cancelled;
        payment.gateway_status = Some(GatewayStatus::Voided);
        payment.audit.stamp_update(ctx);
        if was_counted {
            bill_rules::reverse_payment(&mut bill, payment.amount);
        }
        bill.audit.stamp_update(ctx);
        self.payments.settle_payment(&payment, &bill).await?;

        tracing::info!(payment_id = %payment.id(), bill_id = %bill_id, "Payment voided");
        Ok(payment)
    }

    /// Resolve payments the gateway never answered for. Unresolved ones past the cutoff
    /// become FAILED.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> AppResult<ReconcileReport> {
        let now = self.clock.now();
        let deadline = now - Duration::seconds(self.settings.timeout_seconds as i64);
        let cutoff = now - Duration::hours(self.settings.reconcile_cutoff_hours);
        let pending = self.payments.pending_gateway_payments(deadline).await?;

        let mut report = ReconcileReport {
            examined: pending.len(),
            ..ReconcileReport::default()
        };
        for payment in pending {
            let ctx = RequestContext::system(payment.audit.tenant_id);
            let query = match self
                .gateway
                .query_transaction(payment.transaction_id.as_deref(), payment.method, payment.id())
                .await
            {
                Ok(query) => query,
                Err(e) => {
                    tracing::warn!(error = %e, payment_id = %payment.id(), "Gateway query failed");
                    report.still_pending += 1;
                    continue;
                }
            };
            self.record_exchange(
                &ctx,
                Some(payment.id()),
                GatewayEvent::QueryGateway,
                &query.exchange,
                query.transaction.is_some(),
            )
            .await;

            match query.transaction {
                Some(found) => {
                    let payment_id = payment.id();
                    match self
                        .settlement
                        .apply_gateway_status(&ctx, payment, found.status, Some(found.transaction_id))
                        .await
                    {
                        Ok(Some(status)) if status.is_final() => report.resolved += 1,
                        Ok(_) => report.still_pending += 1,
                        Err(e) => {
                            tracing::error!(error = %e, payment_id = %payment_id, "Failed to apply reconciled status");
                            report.still_pending += 1;
                        }
                    }
                }
                None if payment.audit.created_on < cutoff => {
                    let mut failed = payment;
                    failed.status = PaymentStatus::Failed;
                    failed.gateway_status = Some(GatewayStatus::Failed);
                    failed.audit.stamp_update(&ctx);
                    self.payments.update_payment(&failed).await?;
                    tracing::info!(payment_id = %failed.id(), "Unresolved payment marked failed at cutoff");
                    report.failed += 1;
                }
                None => report.still_pending += 1,
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                resolved = report.resolved,
                failed = report.failed,
                still_pending = report.still_pending,
                "Pending payments reconciled"
            );
        }
        Ok(report)
    }

    /// Pull the processor's transaction list for a tenant and align local statuses. A replay
    /// of the last request id is skipped.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn reconcile_tenant(&self, tenant_id: Uuid) -> AppResult<usize> {
        let now = self.clock.now();
        let ctx = RequestContext::system(tenant_id);
        let state = self.payments.recon_state(tenant_id).await?;
        let start: NaiveDate = state
            .as_ref()
            .and_then(|s| s.last_run_on)
            .map(|t| t.date_naive())
            .unwrap_or_else(|| (now - Duration::days(1)).date_naive());

        let response = self
            .gateway
            .reconcile(start, now.date_naive(), ReconcileQuery::All)
            .await?;
        self.record_exchange(&ctx, None, GatewayEvent::ReconcileGateway, &response.exchange, response.success)
            .await;
        if !response.success {
            return Err(AppError::Gateway(format!(
                "reconcile failed: {} {}",
                response.error_code.unwrap_or_default(),
                response.error_message.unwrap_or_default()
            )));
        }
        let last_request_id = state.and_then(|s| s.gateway_recon_last_request_id);
        if response.request_id.is_some() && response.request_id == last_request_id {
            tracing::debug!("Reconcile response already applied");
            return Ok(0);
        }

        let mut updated = 0;
        for tx in &response.transactions {
            let Some(payment_id) = tx.order_id.as_deref().and_then(|o| Uuid::parse_str(o).ok()) else {
                continue;
            };
            let Some(payment) = self.payments.get_payment(tenant_id, payment_id).await? else {
                continue;
            };
            match self
                .settlement
                .apply_gateway_status(&ctx, payment, tx.status, Some(tx.transaction_id.clone()))
                .await
            {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, payment_id = %payment_id, "Skipping reconciled transaction"),
            }
        }

        self.payments
            .save_recon_state(&GatewayReconState {
                tenant_id,
                gateway_recon_last_request_id: response.request_id,
                last_run_on: Some(now),
            })
            .await?;
        Ok(updated)
    }
}
