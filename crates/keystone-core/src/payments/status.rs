use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{GatewayStatus, Payment, PaymentMethod, PaymentStatus};

/// How the gateway returned the money.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundMethodology {
    /// The transaction was still OPEN and got cancelled.
    Void,
    /// The transaction had SETTLED and a credit was issued.
    ApplyCredit,
}

/// Internal and gateway status right after a sale call.
pub fn status_after_sale(success: bool, method: PaymentMethod) -> (PaymentStatus, GatewayStatus) {
    if !success {
        return (PaymentStatus::Failed, GatewayStatus::Failed);
    }
    match method {
        PaymentMethod::BankTransfer => (PaymentStatus::InProcess, GatewayStatus::Open),
        _ => (PaymentStatus::Completed, GatewayStatus::Open),
    }
}

pub fn refund_status(amount: Decimal, refund_amount: Decimal) -> PaymentStatus {
    if refund_amount >= amount {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    }
}

/// Internal status implied by a gateway status reported by query or reconcile.
pub fn status_from_gateway(gateway: GatewayStatus, payment: &Payment) -> PaymentStatus {
    match gateway {
        GatewayStatus::Open => match payment.method {
            PaymentMethod::BankTransfer => PaymentStatus::InProcess,
            _ => PaymentStatus::Completed,
        },
        GatewayStatus::Settled => {
            if payment.refund_amount > Decimal::ZERO {
                refund_status(payment.amount, payment.refund_amount)
            } else {
                PaymentStatus::Completed
            }
        }
        GatewayStatus::Failed => PaymentStatus::Failed,
        GatewayStatus::Voided => PaymentStatus::Cancelled,
        GatewayStatus::CreditApplied => refund_status(payment.amount, payment.refund_amount),
    }
}

/// Allowed moves: PENDING -> (IN_PROCESS ->) COMPLETED | FAILED | CANCELLED, refunds only
/// out of COMPLETED or PARTIALLY_REFUNDED.
pub fn ensure_transition(from: PaymentStatus, to: PaymentStatus) -> AppResult<()> {
    use PaymentStatus::*;
    let allowed = match (from, to) {
        (a, b) if a == b => true,
        (Pending, InProcess | Completed | Failed | Cancelled) => true,
        (InProcess, Completed | Failed | Cancelled) => true,
        (Completed, Cancelled | Refunded | PartiallyRefunded) => true,
        (PartiallyRefunded, Refunded) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(AppError::InvalidStatus(format!(
            "payment cannot move from {from:?} to {to:?}"
        )))
    }
}

/// Apply a successful refund of `amount` to its parent payment.
pub fn parent_after_refund(
    parent: &mut Payment,
    amount: Decimal,
    methodology: RefundMethodology,
) -> AppResult<()> {
    let refund_amount = refund_total(parent, amount)?;
    let (status, gateway_status) = match methodology {
        RefundMethodology::Void => (PaymentStatus::Cancelled, Some(GatewayStatus::Voided)),
        RefundMethodology::ApplyCredit => (
            refund_status(parent.amount, refund_amount),
            parent
                .method
                .uses_gateway()
                .then_some(GatewayStatus::CreditApplied),
        ),
    };
    ensure_transition(parent.status, status)?;
    parent.refund_amount = refund_amount;
    parent.status = status;
    if gateway_status.is_some() {
        parent.gateway_status = gateway_status;
    }
    Ok(())
}

/// Record money returned outside the gateway (cash, wallet, write-off, adjustment). The
/// parent's gateway status is left alone.
pub fn parent_after_ledger_refund(parent: &mut Payment, amount: Decimal) -> AppResult<()> {
    let refund_amount = refund_total(parent, amount)?;
    let status = refund_status(parent.amount, refund_amount);
    ensure_transition(parent.status, status)?;
    parent.refund_amount = refund_amount;
    parent.status = status;
    Ok(())
}

fn refund_total(parent: &Payment, amount: Decimal) -> AppResult<Decimal> {
    let refund_amount = parent.refund_amount + amount;
    if refund_amount > parent.amount {
        return Err(AppError::TotalRefundRequestedTooLarge {
            requested: refund_amount,
            refundable: parent.amount,
        });
    }
    Ok(refund_amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::{AuditEnvelope, PaymentPlanKind, TransactionType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn payment(method: PaymentMethod, amount: Decimal) -> Payment {
        Payment {
            audit: AuditEnvelope::stamp_create(&RequestContext::system(Uuid::new_v4())),
            bill_id: Uuid::new_v4(),
            parent_id: None,
            refund_request_id: None,
            transaction_type: TransactionType::Payment,
            order_id: "ORD-1".to_string(),
            amount,
            refund_amount: Decimal::ZERO,
            currency: "USD".to_string(),
            method,
            status: PaymentStatus::Completed,
            gateway_status: Some(GatewayStatus::Settled),
            transaction_id: Some("txn-1".to_string()),
            extra_data: serde_json::Value::Null,
            installment_date: None,
            payment_term: None,
            payment_plan: PaymentPlanKind::Full,
            processed_on: None,
        }
    }

    #[test]
    fn ach_sale_is_in_process() {
        assert_eq!(
            status_after_sale(true, PaymentMethod::BankTransfer),
            (PaymentStatus::InProcess, GatewayStatus::Open)
        );
        assert_eq!(
            status_after_sale(true, PaymentMethod::CreditCard).0,
            PaymentStatus::Completed
        );
        assert_eq!(
            status_after_sale(false, PaymentMethod::CreditCard).0,
            PaymentStatus::Failed
        );
    }

    #[test]
    fn credit_moves_parent_to_partial_then_full() {
        let mut p = payment(PaymentMethod::CreditCard, dec!(100));
        parent_after_refund(&mut p, dec!(40), RefundMethodology::ApplyCredit).unwrap();
        assert_eq!(p.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(p.refund_amount, dec!(40));
        parent_after_refund(&mut p, dec!(60), RefundMethodology::ApplyCredit).unwrap();
        assert_eq!(p.status, PaymentStatus::Refunded);
        assert_eq!(p.gateway_status, Some(GatewayStatus::CreditApplied));
    }

    #[test]
    fn void_cancels_parent() {
        let mut p = payment(PaymentMethod::CreditCard, dec!(100));
        parent_after_refund(&mut p, dec!(100), RefundMethodology::Void).unwrap();
        assert_eq!(p.status, PaymentStatus::Cancelled);
        assert_eq!(p.gateway_status, Some(GatewayStatus::Voided));
    }

    #[test]
    fn ledger_refund_keeps_gateway_status() {
        let mut p = payment(PaymentMethod::CreditCard, dec!(100));
        parent_after_ledger_refund(&mut p, dec!(25)).unwrap();
        assert_eq!(p.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(p.refund_amount, dec!(25));
        assert_eq!(p.gateway_status, Some(GatewayStatus::Settled));
        assert!(parent_after_ledger_refund(&mut p, dec!(80)).is_err());
    }

    #[test]
    fn over_refund_rejected() {
        let mut p = payment(PaymentMethod::Cash, dec!(50));
        assert!(parent_after_refund(&mut p, dec!(60), RefundMethodology::ApplyCredit).is_err());
    }

    #[test]
    fn no_moves_out_of_terminal_failure() {
        assert!(ensure_transition(PaymentStatus::Failed, PaymentStatus::Completed).is_err());
        assert!(ensure_transition(PaymentStatus::Refunded, PaymentStatus::Completed).is_err());
        assert!(ensure_transition(PaymentStatus::InProcess, PaymentStatus::Completed).is_ok());
    }
}
