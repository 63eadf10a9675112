//! Refund requests
//!
//! A request splits into child refund payments, one per requested line. Children returning
//! money to a card or bank account go through the gateway, which voids an OPEN transaction
//! or applies a credit to a SETTLED one. Every other method completes immediately and posts
//! an offsetting CREDIT line next to the child.
//!
//! Children left PENDING (gateway unreachable) or FAILED can be re-run with
//! [`RefundService::process`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keystone_core::models::{
    AuditEnvelope, Bill, BillRefundRequest, GatewayEvent, GatewayStatus, NotificationTemplate,
    Payment, PaymentMethod, PaymentPlanKind, PaymentStatus, RefundRequestInput,
    RefundRequestStatus, TransactionType,
};
use keystone_core::payments::{
    bill_status_after_refund, bill_status_on_initiate, parent_after_ledger_refund,
    parent_after_refund, resolve_request_status, validate_refund_request, RefundMethodology,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{BillingStore, PaymentStore, RefundStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLogEntry};
use crate::clock::Clock;
use crate::gateway::PaymentGateway;
use crate::notifier::Notifier;
use crate::payment::transaction_log;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequestView {
    #[serde(flatten)]
    pub request: BillRefundRequest,
    pub refunds: Vec<Payment>,
}

fn display_id(id: Uuid, now: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!("RF-{}-{}", now.format("%Y%m%d"), simple[..8].to_uppercase())
}

/// Ledger line offsetting a refund that never touched the gateway.
fn offsetting_credit(ctx: &RequestContext, child: &Payment, now: DateTime<Utc>) -> Payment {
    let audit = AuditEnvelope::stamp_create_at(ctx, now);
    Payment {
        order_id: audit.id.to_string(),
        audit,
        bill_id: child.bill_id,
        parent_id: Some(child.id()),
        refund_request_id: child.refund_request_id,
        transaction_type: TransactionType::Credit,
        amount: child.amount,
        refund_amount: Decimal::ZERO,
        currency: child.currency.clone(),
        method: child.method,
        status: PaymentStatus::Completed,
        gateway_status: None,
        transaction_id: None,
        extra_data: json!({ "refunded_payment_id": child.parent_id }),
        installment_date: None,
        payment_term: None,
        payment_plan: PaymentPlanKind::Full,
        processed_on: Some(now),
    }
}

/// What happened to one child in a processing run.
enum ChildOutcome {
    Completed,
    Failed(String),
    Deferred,
}

#[derive(Clone)]
pub struct RefundService {
    bills: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentStore>,
    refunds: Arc<dyn RefundStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
}

impl RefundService {
    pub fn new(
        bills: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentStore>,
        refunds: Arc<dyn RefundStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bills,
            payments,
            refunds,
            gateway,
            notifier,
            clock,
        }
    }

    async fn load_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Bill> {
        self.bills
            .get_bill(ctx, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bill {}", bill_id)))
    }

    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id, bill_id = %input.bill))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        input: &RefundRequestInput,
    ) -> AppResult<RefundRequestView> {
        let mut bill = self.load_bill(ctx, input.bill).await?;
        let parents: HashMap<Uuid, Payment> = self
            .payments
            .payments_for_bill(ctx.tenant_id, bill.id())
            .await?
            .into_iter()
            .filter(|p| p.transaction_type == TransactionType::Payment)
            .map(|p| (p.id(), p))
            .collect();

        let now = self.clock.now();
        let validated = validate_refund_request(&bill, input, &parents, now)?;

        let audit = AuditEnvelope::stamp_create_at(ctx, now);
        let request = BillRefundRequest {
            display_id: display_id(audit.id, now),
            audit,
            bill_id: bill.id(),
            refund_type: validated.refund_type,
            total_refund_requested: validated.total,
            total_refund_processed: Decimal::ZERO,
            currency: bill.currency.clone(),
            refund_reason: input.refund_reason.clone(),
            status: RefundRequestStatus::Pending,
            process_handle: None,
        };

        let children: Vec<Payment> = validated
            .lines
            .iter()
            .map(|line| {
                let audit = AuditEnvelope::stamp_create_at(ctx, now);
                Payment {
                    order_id: audit.id.to_string(),
                    audit,
                    bill_id: bill.id(),
                    parent_id: line.parent,
                    refund_request_id: Some(request.id()),
                    transaction_type: TransactionType::Refund,
                    amount: line.amount,
                    refund_amount: Decimal::ZERO,
                    currency: bill.currency.clone(),
                    method: line.method,
                    status: PaymentStatus::Pending,
                    gateway_status: None,
                    transaction_id: None,
                    extra_data: serde_json::Value::Null,
                    installment_date: None,
                    payment_term: None,
                    payment_plan: PaymentPlanKind::Full,
                    processed_on: None,
                }
            })
            .collect();

        bill.status = bill_status_on_initiate(validated.refund_type);
        bill.audit.stamp_update(ctx);
        let request = self
            .refunds
            .create_refund_request(&request, &children, &bill)
            .await?;

        AuditLogEntry::new(AuditEventType::RefundInitiated, ctx.tenant_id)
            .with_user_id(ctx.user_id)
            .with_details(json!({
                "refund_request_id": request.id(),
                "bill_id": bill.id(),
                "refund_type": request.refund_type,
                "amount": request.total_refund_requested,
            }))
            .log();

        self.notifier
            .notify_resident(
                ctx,
                bill.resident_id,
                NotificationTemplate::RefundInitiated,
                json!({
                    "bill_id": bill.id(),
                    "display_id": bill.display_id,
                    "refund_display_id": request.display_id,
                    "amount": request.total_refund_requested,
                    "currency": request.currency,
                }),
            )
            .await;

        self.process(ctx, request.id()).await
    }

    pub async fn get(&self, ctx: &RequestContext, request_id: Uuid) -> AppResult<RefundRequestView> {
        let request = self
            .refunds
            .get_refund_request(ctx, request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("refund request {}", request_id)))?;
        let refunds = self.refunds.refund_children(ctx.tenant_id, request_id).await?;
        Ok(RefundRequestView { request, refunds })
    }

    /// Run every child that is still PENDING or has FAILED, then settle the request and
    /// the bill from the children's statuses.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn process(&self, ctx: &RequestContext, request_id: Uuid) -> AppResult<RefundRequestView> {
        let RefundRequestView {
            mut request,
            refunds: mut children,
        } = self.get(ctx, request_id).await?;
        if request.status == RefundRequestStatus::Completed {
            return Ok(RefundRequestView {
                request,
                refunds: children,
            });
        }
        let mut bill = self.load_bill(ctx, request.bill_id).await?;
        request.process_handle = Some(Uuid::new_v4());

        let mut newly_refunded = Decimal::ZERO;
        for child in children
            .iter_mut()
            .filter(|c| matches!(c.status, PaymentStatus::Pending | PaymentStatus::Failed))
        {
            let mut parent = match child.parent_id {
                Some(id) => self.payments.get_payment(ctx.tenant_id, id).await?,
                None => None,
            };
            let outcome = self.refund_child(ctx, child, parent.as_mut()).await?;
            let now = self.clock.now();
            let mut offset = None;
            match outcome {
                ChildOutcome::Completed => {
                    child.status = PaymentStatus::Completed;
                    child.processed_on = Some(now);
                    newly_refunded += child.amount;
                    if child.method != PaymentMethod::BackToSource {
                        offset = Some(offsetting_credit(ctx, child, now));
                    }
                }
                ChildOutcome::Failed(reason) => {
                    tracing::warn!(refund_id = %child.id(), reason = %reason, "Refund failed");
                    child.status = PaymentStatus::Failed;
                    child.extra_data = json!({ "error": reason });
                    parent = None;
                }
                ChildOutcome::Deferred => continue,
            }
            child.audit.stamp_update(ctx);
            if let Some(p) = parent.as_mut() {
                p.audit.stamp_update(ctx);
            }
            self.refunds
                .record_refund_progress(child, parent.as_ref(), offset.as_ref())
                .await?;
        }

        let statuses: Vec<PaymentStatus> = children.iter().map(|c| c.status).collect();
        request.status = resolve_request_status(&statuses);
        request.total_refund_processed = children
            .iter()
            .filter(|c| c.status == PaymentStatus::Completed)
            .map(|c| c.amount)
            .sum();
        request.audit.stamp_update(ctx);

        bill.refunded_amount += newly_refunded;
        bill.status = bill_status_after_refund(
            request.status,
            request.refund_type,
            bill.refunded_amount,
            bill.paid_amount,
        );
        bill.audit.stamp_update(ctx);
        self.refunds.finish_refund_request(&request, &bill).await?;

        tracing::info!(
            refund_request_id = %request.id(),
            status = ?request.status,
            processed = %request.total_refund_processed,
            bill_status = ?bill.status,
            "Refund request processed"
        );
        Ok(RefundRequestView {
            request,
            refunds: children,
        })
    }

    async fn refund_child(
        &self,
        ctx: &RequestContext,
        child: &mut Payment,
        parent: Option<&mut Payment>,
    ) -> AppResult<ChildOutcome> {
        match child.method {
            PaymentMethod::BackToSource => {
                let Some(parent) = parent else {
                    return Ok(ChildOutcome::Failed("parent payment not found".to_string()));
                };
                let Some(txn) = parent.transaction_id.clone() else {
                    return Ok(ChildOutcome::Failed(
                        "parent payment has no gateway transaction".to_string(),
                    ));
                };
                let response = match self
                    .gateway
                    .refund_transaction(parent.id(), &txn, child.amount, parent.method)
                    .await
                {
                    Ok(r) => r,
                    Err(AppError::Gateway(reason)) => {
                        tracing::warn!(refund_id = %child.id(), reason = %reason, "Refund left pending");
                        return Ok(ChildOutcome::Deferred);
                    }
                    Err(e) => return Err(e),
                };
                let log = transaction_log(
                    ctx,
                    Some(child.id()),
                    GatewayEvent::CreditGateway,
                    keystone_core::models::EventSource::System,
                    &response.exchange,
                    response.success,
                    self.clock.now(),
                );
                if let Err(e) = self.payments.log_transaction(&log).await {
                    tracing::warn!(error = %e, "Failed to write transaction log");
                }
                if !response.success {
                    return Ok(ChildOutcome::Failed(
                        response.error.unwrap_or_else(|| "refund declined".to_string()),
                    ));
                }
                let methodology = response.methodology.unwrap_or(RefundMethodology::ApplyCredit);
                if let Err(e) = parent_after_refund(parent, child.amount, methodology) {
                    return Ok(ChildOutcome::Failed(e.to_string()));
                }
                child.transaction_id = response.transaction_id;
                child.gateway_status = Some(match methodology {
                    RefundMethodology::Void => GatewayStatus::Voided,
                    RefundMethodology::ApplyCredit => GatewayStatus::CreditApplied,
                });
                Ok(ChildOutcome::Completed)
            }
            PaymentMethod::Cash
            | PaymentMethod::Wallet
            | PaymentMethod::WriteOff
            | PaymentMethod::Adjustment => match parent {
                Some(parent) => match parent_after_ledger_refund(parent, child.amount) {
                    Ok(()) => Ok(ChildOutcome::Completed),
                    Err(e) => Ok(ChildOutcome::Failed(e.to_string())),
                },
                None if child.method.requires_parent() => {
                    Ok(ChildOutcome::Failed("parent payment not found".to_string()))
                }
                None => Ok(ChildOutcome::Completed),
            },
            other => Ok(ChildOutcome::Failed(format!(
                "{:?} cannot carry a refund",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_display_id_carries_prefix() {
        let id = display_id(Uuid::new_v4(), Utc::now());
        assert!(id.starts_with("RF-"));
        assert_eq!(id.len(), "RF-YYYYMMDD-".len() + 8);
    }
}
