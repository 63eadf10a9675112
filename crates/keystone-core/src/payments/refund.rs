//! Refund request validation and status resolution.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::constants::PARTIAL_REFUND_MIN_AGE_HOURS;
use crate::error::{AppError, AppResult};
use crate::models::{
    Bill, BillStatus, Payment, PaymentMethod, PaymentStatus, RefundRequestInput,
    RefundRequestStatus, RefundType,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRefundLine {
    pub parent: Option<Uuid>,
    pub method: PaymentMethod,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRefund {
    pub refund_type: RefundType,
    pub total: Decimal,
    pub lines: Vec<ValidatedRefundLine>,
}

/// Validate a refund request against its bill and the referenced parent payments.
///
/// `parents` must contain every payment named by a line; a missing entry is reported as
/// `invalid_payment_ids`.
pub fn validate_refund_request(
    bill: &Bill,
    input: &RefundRequestInput,
    parents: &HashMap<Uuid, Payment>,
    now: DateTime<Utc>,
) -> AppResult<ValidatedRefund> {
    if !bill.status.is_refundable() {
        return Err(AppError::InvalidStatus(format!(
            "bill in status {:?} cannot be refunded",
            bill.status
        )));
    }
    if input.refund_transactions.is_empty() {
        return Err(AppError::MissingRequiredParam(
            "refund_transactions".to_string(),
        ));
    }

    let mut per_parent: HashMap<Uuid, Decimal> = HashMap::new();
    let mut lines = Vec::with_capacity(input.refund_transactions.len());
    for tx in &input.refund_transactions {
        if !tx.payment_method.is_refund_method() {
            return Err(AppError::InvalidRefundMethod(format!(
                "{:?} cannot be used for refunds",
                tx.payment_method
            )));
        }
        if tx.amount <= Decimal::ZERO {
            return Err(AppError::InvalidAmount(
                "refund amount must be positive".to_string(),
            ));
        }
        if tx.payment_method.requires_parent() && tx.parent.is_none() {
            return Err(AppError::MissingRequiredParam(format!(
                "parent payment for {:?} refund",
                tx.payment_method
            )));
        }
        if let Some(parent_id) = tx.parent {
            let parent = parents
                .get(&parent_id)
                .filter(|p| p.bill_id == bill.id())
                .ok_or_else(|| AppError::InvalidPaymentIds(parent_id.to_string()))?;
            *per_parent.entry(parent_id).or_default() += tx.amount;
            check_parent(parent, per_parent[&parent_id], now)?;
        }
        lines.push(ValidatedRefundLine {
            parent: tx.parent,
            method: tx.payment_method,
            amount: tx.amount,
        });
    }

    let total: Decimal = lines.iter().map(|l| l.amount).sum();
    let refundable = bill.total_refundable_amount();
    if total > refundable {
        return Err(AppError::TotalRefundRequestedTooLarge {
            requested: total,
            refundable,
        });
    }

    let derived = if total == bill.patient_amount {
        RefundType::FullRefund
    } else {
        RefundType::PartialRefund
    };
    if let Some(requested) = input.refund_type {
        if requested != derived {
            return Err(AppError::InvalidRefundType(format!(
                "requested {requested:?} but amounts make it {derived:?}"
            )));
        }
    }

    Ok(ValidatedRefund {
        refund_type: derived,
        total,
        lines,
    })
}

fn check_parent(parent: &Payment, requested: Decimal, now: DateTime<Utc>) -> AppResult<()> {
    let refundable = parent.refundable_amount();
    if requested > refundable {
        return Err(AppError::TotalRefundRequestedTooLarge {
            requested,
            refundable,
        });
    }
    if parent.method != PaymentMethod::Cash {
        let settled_at = parent.processed_on.unwrap_or(parent.audit.created_on);
        let young = now - settled_at < Duration::hours(PARTIAL_REFUND_MIN_AGE_HOURS);
        if young && requested != refundable {
            return Err(AppError::CannotPartiallyRefund(format!(
                "payment {} is younger than {PARTIAL_REFUND_MIN_AGE_HOURS}h; only a full refund is allowed",
                parent.id()
            )));
        }
    }
    Ok(())
}

/// Request status from the final statuses of its child refund payments.
pub fn resolve_request_status(children: &[PaymentStatus]) -> RefundRequestStatus {
    let completed = children
        .iter()
        .filter(|s| **s == PaymentStatus::Completed)
        .count();
    let pending = children.iter().any(|s| !s.is_final());
    match (completed, pending) {
        (_, true) => RefundRequestStatus::InProgress,
        (0, false) => RefundRequestStatus::Failed,
        (n, false) if n == children.len() => RefundRequestStatus::Completed,
        _ => RefundRequestStatus::PartialSuccess,
    }
}

pub fn bill_status_on_initiate(refund_type: RefundType) -> BillStatus {
    match refund_type {
        RefundType::FullRefund => BillStatus::RefundInitiated,
        RefundType::PartialRefund => BillStatus::PartialRefundInitiated,
    }
}

/// Bill status once a request settles. `refunded_total` includes this request.
pub fn bill_status_after_refund(
    request_status: RefundRequestStatus,
    refund_type: RefundType,
    refunded_total: Decimal,
    paid_amount: Decimal,
) -> BillStatus {
    match request_status {
        RefundRequestStatus::Completed | RefundRequestStatus::PartialSuccess => {
            if refunded_total >= paid_amount && paid_amount > Decimal::ZERO {
                BillStatus::Refunded
            } else {
                BillStatus::PartiallyRefunded
            }
        }
        RefundRequestStatus::Failed => match refund_type {
            RefundType::FullRefund => BillStatus::RefundFailed,
            RefundType::PartialRefund => BillStatus::PartialRefundFailed,
        },
        RefundRequestStatus::Pending | RefundRequestStatus::InProgress => {
            bill_status_on_initiate(refund_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::{
        AuditEnvelope, GatewayStatus, PaymentPlanKind, RefundTransactionInput, TransactionType,
    };
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn bill(ctx: &RequestContext) -> Bill {
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        Bill {
            audit: AuditEnvelope::stamp_create(ctx),
            display_id: "B-1".to_string(),
            resident_id: Uuid::new_v4(),
            location_id: None,
            service_description: None,
            service_date: day,
            statement_date: day,
            due_date: day,
            paid_date: Some(day),
            status: BillStatus::Completed,
            currency: "USD".to_string(),
            tax_state: None,
            total_charges: dec!(100),
            insurance_paid: Decimal::ZERO,
            patient_amount: dec!(100),
            other_discount: Decimal::ZERO,
            other_adjustment: Decimal::ZERO,
            other_writeoff: Decimal::ZERO,
            other_tax: Decimal::ZERO,
            paid_amount: dec!(100),
            refunded_amount: Decimal::ZERO,
            cancellation_reason: None,
            cancellation_code: None,
        }
    }

    fn paid(ctx: &RequestContext, bill: &Bill, age_hours: i64) -> Payment {
        Payment {
            audit: AuditEnvelope::stamp_create(ctx),
            bill_id: bill.id(),
            parent_id: None,
            refund_request_id: None,
            transaction_type: TransactionType::Payment,
            order_id: "ORD-1".to_string(),
            amount: dec!(100),
            refund_amount: Decimal::ZERO,
            currency: "USD".to_string(),
            method: PaymentMethod::CreditCard,
            status: PaymentStatus::Completed,
            gateway_status: Some(GatewayStatus::Settled),
            transaction_id: Some("txn-1".to_string()),
            extra_data: serde_json::Value::Null,
            installment_date: None,
            payment_term: None,
            payment_plan: PaymentPlanKind::Full,
            processed_on: Some(Utc::now() - Duration::hours(age_hours)),
        }
    }

    fn request(bill: &Bill, parent: Option<Uuid>, amount: Decimal) -> RefundRequestInput {
        RefundRequestInput {
            bill: bill.id(),
            refund_type: Some(RefundType::PartialRefund),
            refund_reason: None,
            refund_transactions: vec![RefundTransactionInput {
                parent,
                payment_method: PaymentMethod::BackToSource,
                amount,
            }],
        }
    }

    #[test]
    fn partial_back_to_source_on_settled_payment() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let b = bill(&ctx);
        let p = paid(&ctx, &b, 48);
        let parents = HashMap::from([(p.id(), p.clone())]);

        let v = validate_refund_request(&b, &request(&b, Some(p.id()), dec!(40)), &parents, Utc::now())
            .unwrap();

        assert_eq!(v.refund_type, RefundType::PartialRefund);
        assert_eq!(v.total, dec!(40));
        assert_eq!(
            bill_status_after_refund(
                RefundRequestStatus::Completed,
                v.refund_type,
                dec!(40),
                b.paid_amount
            ),
            BillStatus::PartiallyRefunded
        );
    }

    #[test]
    fn young_card_payment_refuses_partial() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let b = bill(&ctx);
        let p = paid(&ctx, &b, 2);
        let parents = HashMap::from([(p.id(), p.clone())]);
        assert!(matches!(
            validate_refund_request(&b, &request(&b, Some(p.id()), dec!(40)), &parents, Utc::now()),
            Err(AppError::CannotPartiallyRefund(_))
        ));
    }

    #[test]
    fn back_to_source_needs_parent() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let b = bill(&ctx);
        assert!(matches!(
            validate_refund_request(&b, &request(&b, None, dec!(40)), &HashMap::new(), Utc::now()),
            Err(AppError::MissingRequiredParam(_))
        ));
    }

    #[test]
    fn refund_type_mismatch_rejected() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let b = bill(&ctx);
        let p = paid(&ctx, &b, 48);
        let parents = HashMap::from([(p.id(), p.clone())]);
        assert!(matches!(
            validate_refund_request(&b, &request(&b, Some(p.id()), dec!(100)), &parents, Utc::now()),
            Err(AppError::InvalidRefundType(_))
        ));
    }

    #[test]
    fn split_lines_cannot_exceed_parent() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let b = bill(&ctx);
        let p = paid(&ctx, &b, 48);
        let parents = HashMap::from([(p.id(), p.clone())]);
        let mut input = request(&b, Some(p.id()), dec!(60));
        input.refund_type = None;
        input.refund_transactions.push(RefundTransactionInput {
            parent: Some(p.id()),
            payment_method: PaymentMethod::Cash,
            amount: dec!(60),
        });
        assert!(matches!(
            validate_refund_request(&b, &input, &parents, Utc::now()),
            Err(AppError::TotalRefundRequestedTooLarge { .. })
        ));
    }

    #[test]
    fn request_status_resolution() {
        use PaymentStatus::*;
        assert_eq!(resolve_request_status(&[Completed, Completed]), RefundRequestStatus::Completed);
        assert_eq!(resolve_request_status(&[Completed, Failed]), RefundRequestStatus::PartialSuccess);
        assert_eq!(resolve_request_status(&[Failed]), RefundRequestStatus::Failed);
        assert_eq!(resolve_request_status(&[Pending, Completed]), RefundRequestStatus::InProgress);
    }
}
