use chrono::Duration;
use keystone_core::models::{
    BillStatus, GatewayStatus, PayRequest, PaymentMethod, PaymentPlanKind, PaymentStatus,
};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Seeded {
    services: TestServices,
    ctx: RequestContext,
    resident_id: Uuid,
    resident_user_id: Uuid,
}

fn seed() -> Seeded {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let staff_user = create_test_user(tenant.id, "cashier@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "dana@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);

    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let (resident_id, resident_user_id) = (resident.audit.id, resident_user.audit.id);
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });
    Seeded {
        services,
        ctx,
        resident_id,
        resident_user_id,
    }
}

/// An untaxed bill for `amount`.
async fn bill_for(seeded: &Seeded, amount: Decimal) -> Uuid {
    let mut line = breakdown_line(dec!(1), amount);
    line.service_taxable = false;
    let input = create_test_bill_input(seeded.resident_id, None, vec![line]);
    seeded
        .services
        .billing
        .create(&seeded.ctx, &input)
        .await
        .unwrap()
        .bill
        .audit
        .id
}

fn card_request(number: &str) -> PayRequest {
    let mut card = test_card();
    card.number = number.to_string();
    PayRequest {
        amount: None,
        payment_method: PaymentMethod::CreditCard,
        payment_plan_id: None,
        installment_date: None,
        saved_card: None,
        card: Some(card),
        saved_account: None,
        account: None,
        cvv: Some("123".to_string()),
        save_method: false,
        make_primary: false,
    }
}

#[tokio::test]
async fn test_card_payment_completes_bill() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;

    let response = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &card_request("4111111111111111"))
        .await
        .unwrap();
    assert_eq!(response.status, PaymentStatus::Completed);

    let payment = seeded
        .services
        .store
        .payment(response.payment_id.unwrap())
        .unwrap();
    assert_eq!(payment.amount, dec!(100));
    assert_eq!(payment.gateway_status, Some(GatewayStatus::Open));
    assert_eq!(payment.order_id, payment.audit.id.to_string());
    let txn = payment.transaction_id.clone().unwrap();
    assert_eq!(
        seeded.services.gateway.status_of(&txn),
        Some(GatewayStatus::Open)
    );

    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.status, BillStatus::Completed);
    assert_eq!(bill.paid_amount, dec!(100));
    assert!(!seeded.services.store.transaction_logs().is_empty());

    let again = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &card_request("4111111111111111"))
        .await;
    assert!(matches!(again, Err(AppError::PaymentDone)));
}

#[tokio::test]
async fn test_partial_payment_leaves_balance() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;
    let request = PayRequest {
        amount: Some(dec!(30)),
        ..card_request("4111111111111111")
    };
    seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &request)
        .await
        .unwrap();

    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.status, BillStatus::PartiallyCompleted);
    assert_eq!(bill.balance_due(), dec!(70));

    let too_much = PayRequest {
        amount: Some(dec!(80)),
        ..card_request("4111111111111111")
    };
    let result = seeded.services.payments.pay(&seeded.ctx, bill_id, &too_much).await;
    assert!(matches!(result, Err(AppError::InvalidAmount(_))));
}

#[tokio::test]
async fn test_declined_card_fails_unpaid_bill() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;

    let response = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &card_request("4000000000000002"))
        .await
        .unwrap();
    assert_eq!(response.status, PaymentStatus::Failed);

    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.status, BillStatus::Failed);
    assert_eq!(bill.paid_amount, dec!(0));
}

#[tokio::test]
async fn test_invalid_cvv_is_rejected_before_gateway() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;
    let request = PayRequest {
        cvv: Some("12".to_string()),
        ..card_request("4111111111111111")
    };
    let result = seeded.services.payments.pay(&seeded.ctx, bill_id, &request).await;
    assert!(matches!(result, Err(AppError::InvalidCvv)));

    let missing = PayRequest {
        card: None,
        ..card_request("4111111111111111")
    };
    let result = seeded.services.payments.pay(&seeded.ctx, bill_id, &missing).await;
    assert!(matches!(result, Err(AppError::CardMissingPayment)));
}

#[tokio::test]
async fn test_gateway_outage_leaves_payment_pending_until_reconciled() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;
    seeded.services.gateway.set_offline(true);

    let response = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &card_request("4111111111111111"))
        .await
        .unwrap();
    assert_eq!(response.status, PaymentStatus::Pending);
    let payment_id = response.payment_id.unwrap();
    assert_eq!(
        seeded.services.store.bill(bill_id).unwrap().status,
        BillStatus::Pending
    );

    // Still unreachable: nothing is resolved.
    seeded.services.clock.advance(Duration::minutes(5));
    let report = seeded.services.payments.reconcile_pending().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.still_pending, 1);

    // Reachable but the processor never saw the sale: failed once past the cutoff.
    seeded.services.gateway.set_offline(false);
    seeded.services.clock.advance(Duration::hours(49));
    let report = seeded.services.payments.reconcile_pending().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(
        seeded.services.store.payment(payment_id).unwrap().status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn test_cash_is_staff_only() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(50)).await;
    let cash = PayRequest {
        payment_method: PaymentMethod::Cash,
        card: None,
        cvv: None,
        ..card_request("4111111111111111")
    };

    let resident = resident_context(
        seeded.ctx.tenant_id,
        seeded.resident_user_id,
        seeded.resident_id,
    );
    let result = seeded.services.payments.pay(&resident, bill_id, &cash).await;
    assert!(matches!(result, Err(AppError::InvalidPaymentMethod(_))));

    let response = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &cash)
        .await
        .unwrap();
    assert_eq!(response.status, PaymentStatus::Completed);
    assert_eq!(
        seeded.services.store.bill(bill_id).unwrap().status,
        BillStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_last_voids_open_transaction() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(100)).await;
    let response = seeded
        .services
        .payments
        .pay(&seeded.ctx, bill_id, &card_request("4111111111111111"))
        .await
        .unwrap();

    let voided = seeded
        .services
        .payments
        .cancel_last(&seeded.ctx, bill_id)
        .await
        .unwrap();
    assert_eq!(Some(voided.audit.id), response.payment_id);
    assert_eq!(voided.status, PaymentStatus::Cancelled);
    assert_eq!(voided.gateway_status, Some(GatewayStatus::Voided));

    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.paid_amount, dec!(0));

    let nothing_left = seeded.services.payments.cancel_last(&seeded.ctx, bill_id).await;
    assert!(matches!(nothing_left, Err(AppError::NoTransactionFound(_))));
}

#[tokio::test]
async fn test_payment_plan_consent_and_first_installment() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(300)).await;
    let plan = create_test_payment_plan(seeded.ctx.tenant_id, 3);
    let plan_id = plan.audit.id;
    seeded.services.store.with_state(|s| {
        s.payment_plans.insert(plan.audit.id, plan);
    });

    let request = PayRequest {
        payment_plan_id: Some(plan_id),
        ..card_request("4111111111111111")
    };
    let bpp = seeded
        .services
        .plans
        .process_consent(&seeded.ctx, bill_id, &request)
        .await
        .unwrap();
    assert_eq!(bpp.duration, 3);
    assert_eq!(bpp.emi, dec!(100));
    assert_eq!(bpp.start_date, date("2025-01-01"));
    assert_eq!(
        seeded.services.store.bill(bill_id).unwrap().status,
        BillStatus::OnPp
    );

    let upcoming = seeded
        .services
        .plans
        .upcoming(&seeded.ctx, bill_id, 3)
        .await
        .unwrap();
    assert_eq!(
        upcoming,
        vec![date("2025-01-01"), date("2025-02-01"), date("2025-03-01")]
    );

    let second = seeded
        .services
        .plans
        .process_consent(&seeded.ctx, bill_id, &request)
        .await;
    assert!(second.is_err());

    let report = seeded
        .services
        .plans
        .run_installments(date("2025-01-01"))
        .await
        .unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.charged, 1);
    assert_eq!(report.completed_plans, 0);

    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.paid_amount, dec!(100));
    assert_eq!(bill.status, BillStatus::OnPp);

    // Charged at most once per day.
    let rerun = seeded
        .services
        .plans
        .run_installments(date("2025-01-01"))
        .await
        .unwrap();
    assert_eq!(rerun.due, 0);
}

#[tokio::test]
async fn test_plan_start_date_cannot_be_in_the_past() {
    let seeded = seed();
    let bill_id = bill_for(&seeded, dec!(300)).await;
    let plan = create_test_payment_plan(seeded.ctx.tenant_id, 3);
    let plan_id = plan.audit.id;
    seeded.services.store.with_state(|s| {
        s.payment_plans.insert(plan.audit.id, plan);
    });

    let request = PayRequest {
        payment_plan_id: Some(plan_id),
        installment_date: Some(date("2024-12-15")),
        ..card_request("4111111111111111")
    };
    let result = seeded
        .services
        .plans
        .process_consent(&seeded.ctx, bill_id, &request)
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
}

/// A bill of 200 on a two-installment plan starting 2025-01-01.
async fn bill_on_plan(seeded: &Seeded) -> Uuid {
    let bill_id = bill_for(seeded, dec!(200)).await;
    let plan = create_test_payment_plan(seeded.ctx.tenant_id, 2);
    let plan_id = plan.audit.id;
    seeded.services.store.with_state(|s| {
        s.payment_plans.insert(plan.audit.id, plan);
    });
    let request = PayRequest {
        payment_plan_id: Some(plan_id),
        ..card_request("4111111111111111")
    };
    seeded
        .services
        .plans
        .process_consent(&seeded.ctx, bill_id, &request)
        .await
        .unwrap();
    bill_id
}

fn installment_terms(seeded: &Seeded, bill_id: Uuid) -> Vec<(Option<i32>, PaymentStatus)> {
    seeded.services.store.with_state(|s| {
        let mut terms: Vec<_> = s
            .payments
            .values()
            .filter(|p| p.bill_id == bill_id && p.payment_plan == PaymentPlanKind::Monthly)
            .map(|p| (p.payment_term, p.status))
            .collect();
        terms.sort_by_key(|(term, _)| *term);
        terms
    })
}

fn plan_progress(seeded: &Seeded, bill_id: Uuid) -> (i32, Decimal, bool) {
    seeded.services.store.with_state(|s| {
        s.bill_payment_plans
            .values()
            .find(|p| p.bill_id == bill_id)
            .map(|p| (p.installments_paid, p.paid_amount, p.active))
            .unwrap()
    })
}

#[tokio::test]
async fn test_reconciled_installment_advances_plan_and_is_not_charged_again() {
    let seeded = seed();
    let bill_id = bill_on_plan(&seeded).await;

    // The processor takes the charge but the answer never arrives.
    seeded.services.gateway.set_lose_responses(true);
    let first = seeded
        .services
        .plans
        .run_installments(date("2025-01-01"))
        .await
        .unwrap();
    assert_eq!(first.deferred, 1);
    seeded.services.gateway.set_lose_responses(false);

    seeded.services.clock.advance(Duration::minutes(5));
    let report = seeded.services.payments.reconcile_pending().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(plan_progress(&seeded, bill_id), (1, dec!(100), true));
    assert_eq!(seeded.services.store.bill(bill_id).unwrap().paid_amount, dec!(100));

    seeded.services.clock.advance(Duration::days(1));
    let next_day = seeded
        .services
        .plans
        .run_installments(date("2025-01-02"))
        .await
        .unwrap();
    assert_eq!(next_day.due, 0);
    assert_eq!(
        installment_terms(&seeded, bill_id),
        vec![(Some(1), PaymentStatus::Completed)]
    );

    seeded.services.clock.advance(Duration::days(30));
    let last = seeded
        .services
        .plans
        .run_installments(date("2025-02-01"))
        .await
        .unwrap();
    assert_eq!(last.charged, 1);
    assert_eq!(last.completed_plans, 1);
    assert_eq!(plan_progress(&seeded, bill_id), (2, dec!(200), false));
    let bill = seeded.services.store.bill(bill_id).unwrap();
    assert_eq!(bill.paid_amount, dec!(200));
    assert_eq!(bill.status, BillStatus::Completed);
}

#[tokio::test]
async fn test_unresolved_installment_is_queried_instead_of_recharged() {
    let seeded = seed();
    let bill_id = bill_on_plan(&seeded).await;

    seeded.services.gateway.set_lose_responses(true);
    seeded
        .services
        .plans
        .run_installments(date("2025-01-01"))
        .await
        .unwrap();
    seeded.services.gateway.set_lose_responses(false);

    seeded.services.clock.advance(Duration::days(1));
    let report = seeded
        .services
        .plans
        .run_installments(date("2025-01-02"))
        .await
        .unwrap();

    assert_eq!(report.due, 1);
    assert_eq!(report.charged, 1);
    assert_eq!(
        installment_terms(&seeded, bill_id),
        vec![(Some(1), PaymentStatus::Completed)]
    );
    assert_eq!(plan_progress(&seeded, bill_id), (1, dec!(100), true));
    assert_eq!(seeded.services.store.bill(bill_id).unwrap().paid_amount, dec!(100));
}
