use chrono::Duration;
use keystone_core::models::{
    BillStatus, GatewayStatus, PayRequest, PaymentMethod, PaymentStatus, RefundRequestInput,
    RefundRequestStatus, RefundTransactionInput, RefundType, TransactionType,
};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Paid {
    services: TestServices,
    ctx: RequestContext,
    bill_id: Uuid,
    payment_id: Uuid,
    transaction_id: String,
}

/// A 100.00 untaxed bill paid in full by card.
async fn paid_bill() -> Paid {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let staff_user = create_test_user(tenant.id, "refunds@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "erin@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let resident_id = resident.audit.id;
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });

    let mut line = breakdown_line(dec!(1), dec!(100));
    line.service_taxable = false;
    let input = create_test_bill_input(resident_id, None, vec![line]);
    let bill_id = services
        .billing
        .create(&ctx, &input)
        .await
        .unwrap()
        .bill
        .audit
        .id;

    let request = PayRequest {
        amount: None,
        payment_method: PaymentMethod::CreditCard,
        payment_plan_id: None,
        installment_date: None,
        saved_card: None,
        card: Some(test_card()),
        saved_account: None,
        account: None,
        cvv: Some("123".to_string()),
        save_method: false,
        make_primary: false,
    };
    let payment_id = services
        .payments
        .pay(&ctx, bill_id, &request)
        .await
        .unwrap()
        .payment_id
        .unwrap();
    let transaction_id = services
        .store
        .payment(payment_id)
        .and_then(|p| p.transaction_id)
        .unwrap();

    Paid {
        services,
        ctx,
        bill_id,
        payment_id,
        transaction_id,
    }
}

fn back_to_source(paid: &Paid, amount: Decimal, refund_type: Option<RefundType>) -> RefundRequestInput {
    RefundRequestInput {
        bill: paid.bill_id,
        refund_type,
        refund_reason: Some("Event cancelled".to_string()),
        refund_transactions: vec![RefundTransactionInput {
            parent: Some(paid.payment_id),
            payment_method: PaymentMethod::BackToSource,
            amount,
        }],
    }
}

#[tokio::test]
async fn test_partial_refund_of_settled_payment() {
    let paid = paid_bill().await;
    paid.services.gateway.settle(&paid.transaction_id).unwrap();
    paid.services.clock.advance(Duration::hours(25));

    let view = paid
        .services
        .refunds
        .create(
            &paid.ctx,
            &back_to_source(&paid, dec!(40), Some(RefundType::PartialRefund)),
        )
        .await
        .unwrap();

    assert_eq!(view.request.status, RefundRequestStatus::Completed);
    assert_eq!(view.request.refund_type, RefundType::PartialRefund);
    assert_eq!(view.request.total_refund_processed, dec!(40));
    assert!(view.request.display_id.starts_with("RF-"));
    assert_eq!(view.refunds.len(), 1);
    let child = &view.refunds[0];
    assert_eq!(child.transaction_type, TransactionType::Refund);
    assert_eq!(child.status, PaymentStatus::Completed);
    assert_eq!(child.gateway_status, Some(GatewayStatus::CreditApplied));

    let parent = paid.services.store.payment(paid.payment_id).unwrap();
    assert_eq!(parent.refund_amount, dec!(40));

    let bill = paid.services.store.bill(paid.bill_id).unwrap();
    assert_eq!(bill.status, BillStatus::PartiallyRefunded);
    assert_eq!(bill.refunded_amount, dec!(40));
}

#[tokio::test]
async fn test_full_refund_of_open_payment_voids_it() {
    let paid = paid_bill().await;

    let view = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(100), None))
        .await
        .unwrap();
    assert_eq!(view.request.refund_type, RefundType::FullRefund);
    assert_eq!(view.request.status, RefundRequestStatus::Completed);
    assert_eq!(view.refunds[0].gateway_status, Some(GatewayStatus::Voided));
    assert_eq!(
        paid.services.gateway.status_of(&paid.transaction_id),
        Some(GatewayStatus::Voided)
    );

    let bill = paid.services.store.bill(paid.bill_id).unwrap();
    assert_eq!(bill.status, BillStatus::Refunded);
}

#[tokio::test]
async fn test_young_payment_cannot_be_partially_refunded() {
    let paid = paid_bill().await;
    paid.services.clock.advance(Duration::hours(2));

    let result = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(40), None))
        .await;
    assert!(matches!(result, Err(AppError::CannotPartiallyRefund(_))));
}

#[tokio::test]
async fn test_refund_larger_than_paid_is_rejected() {
    let paid = paid_bill().await;
    paid.services.clock.advance(Duration::hours(25));

    let result = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(150), None))
        .await;
    assert!(matches!(
        result,
        Err(AppError::TotalRefundRequestedTooLarge { .. })
    ));
}

#[tokio::test]
async fn test_refund_type_must_match_amounts() {
    let paid = paid_bill().await;
    paid.services.clock.advance(Duration::hours(25));

    let result = paid
        .services
        .refunds
        .create(
            &paid.ctx,
            &back_to_source(&paid, dec!(40), Some(RefundType::FullRefund)),
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidRefundType(_))));
}

#[tokio::test]
async fn test_unknown_parent_payment_is_rejected() {
    let paid = paid_bill().await;
    let input = RefundRequestInput {
        refund_transactions: vec![RefundTransactionInput {
            parent: Some(Uuid::new_v4()),
            payment_method: PaymentMethod::BackToSource,
            amount: dec!(100),
        }],
        ..back_to_source(&paid, dec!(100), None)
    };
    let result = paid.services.refunds.create(&paid.ctx, &input).await;
    assert!(matches!(result, Err(AppError::InvalidPaymentIds(_))));
}

#[tokio::test]
async fn test_gateway_outage_leaves_refund_in_progress_until_reprocessed() {
    let paid = paid_bill().await;
    paid.services.gateway.settle(&paid.transaction_id).unwrap();
    paid.services.clock.advance(Duration::hours(25));
    paid.services.gateway.set_offline(true);

    let view = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(40), None))
        .await
        .unwrap();
    assert_eq!(view.request.status, RefundRequestStatus::InProgress);
    assert_eq!(view.refunds[0].status, PaymentStatus::Pending);
    assert_eq!(
        paid.services.store.bill(paid.bill_id).unwrap().status,
        BillStatus::PartialRefundInitiated
    );

    paid.services.gateway.set_offline(false);
    let view = paid
        .services
        .refunds
        .process(&paid.ctx, view.request.audit.id)
        .await
        .unwrap();
    assert_eq!(view.request.status, RefundRequestStatus::Completed);
    assert_eq!(
        paid.services.store.payment(paid.payment_id).unwrap().refund_amount,
        dec!(40)
    );

    // A completed request is returned unchanged.
    let again = paid
        .services
        .refunds
        .process(&paid.ctx, view.request.audit.id)
        .await
        .unwrap();
    assert_eq!(again.request.total_refund_processed, dec!(40));
    assert_eq!(
        paid.services.store.bill(paid.bill_id).unwrap().refunded_amount,
        dec!(40)
    );
}

#[tokio::test]
async fn test_wallet_refund_completes_without_gateway() {
    let paid = paid_bill().await;
    paid.services.gateway.set_offline(true);
    let input = RefundRequestInput {
        refund_transactions: vec![RefundTransactionInput {
            parent: None,
            payment_method: PaymentMethod::Wallet,
            amount: dec!(25),
        }],
        ..back_to_source(&paid, dec!(25), None)
    };

    let view = paid.services.refunds.create(&paid.ctx, &input).await.unwrap();
    assert_eq!(view.request.status, RefundRequestStatus::Completed);
    assert_eq!(view.refunds.len(), 1);
    assert_eq!(
        paid.services.store.bill(paid.bill_id).unwrap().status,
        BillStatus::PartiallyRefunded
    );

    let credits = credit_lines(&paid);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].parent_id, Some(view.refunds[0].audit.id));
    assert_eq!(credits[0].amount, dec!(25));
    assert_eq!(credits[0].method, PaymentMethod::Wallet);
    assert_eq!(credits[0].status, PaymentStatus::Completed);
}

fn credit_lines(paid: &Paid) -> Vec<keystone_core::models::Payment> {
    paid.services.store.with_state(|s| {
        s.payments
            .values()
            .filter(|p| p.bill_id == paid.bill_id && p.transaction_type == TransactionType::Credit)
            .cloned()
            .collect()
    })
}

#[tokio::test]
async fn test_wallet_refund_draws_down_parent_before_back_to_source() {
    let paid = paid_bill().await;
    paid.services.gateway.settle(&paid.transaction_id).unwrap();
    paid.services.clock.advance(Duration::hours(25));

    let wallet = RefundRequestInput {
        refund_transactions: vec![RefundTransactionInput {
            parent: Some(paid.payment_id),
            payment_method: PaymentMethod::Wallet,
            amount: dec!(25),
        }],
        ..back_to_source(&paid, dec!(25), None)
    };
    paid.services.refunds.create(&paid.ctx, &wallet).await.unwrap();

    let parent = paid.services.store.payment(paid.payment_id).unwrap();
    assert_eq!(parent.refund_amount, dec!(25));
    assert_eq!(parent.status, PaymentStatus::PartiallyRefunded);
    assert_eq!(parent.gateway_status, Some(GatewayStatus::Settled));

    // Only what is left on the parent can still go back to the card.
    let too_much = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(100), None))
        .await;
    assert!(matches!(
        too_much,
        Err(AppError::TotalRefundRequestedTooLarge { .. })
    ));

    let view = paid
        .services
        .refunds
        .create(&paid.ctx, &back_to_source(&paid, dec!(75), None))
        .await
        .unwrap();
    assert_eq!(view.request.status, RefundRequestStatus::Completed);

    let parent = paid.services.store.payment(paid.payment_id).unwrap();
    assert_eq!(parent.refund_amount, dec!(100));
    assert_eq!(parent.status, PaymentStatus::Refunded);
    let bill = paid.services.store.bill(paid.bill_id).unwrap();
    assert_eq!(bill.refunded_amount, dec!(100));
    assert_eq!(bill.status, BillStatus::Refunded);
    assert_eq!(credit_lines(&paid).len(), 1);
}
