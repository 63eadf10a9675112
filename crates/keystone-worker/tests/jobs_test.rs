use std::sync::Arc;

use chrono::Duration;
use keystone_core::models::{PayRequest, PaymentMethod, PaymentStatus};
use keystone_services::test_helpers::*;
use keystone_services::Clock;
use keystone_worker::{InstallmentJob, ReconcileJob};
use rust_decimal_macros::dec;

fn card_request() -> PayRequest {
    PayRequest {
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
    }
}

#[tokio::test]
async fn test_reconciler_resolves_timed_out_payment() {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let tenant_id = tenant.id;
    let staff_user = create_test_user(tenant.id, "night@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "ivan@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let resident_id = resident.audit.id;
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });

    let mut line = breakdown_line(dec!(1), dec!(75));
    line.service_taxable = false;
    let bill_id = services
        .billing
        .create(&ctx, &create_test_bill_input(resident_id, None, vec![line]))
        .await
        .unwrap()
        .bill
        .audit
        .id;

    services.gateway.set_offline(true);
    let payment_id = services
        .payments
        .pay(&ctx, bill_id, &card_request())
        .await
        .unwrap()
        .payment_id
        .unwrap();
    services.gateway.set_offline(false);
    services.clock.advance(Duration::hours(49));

    let job = ReconcileJob::new(
        services.payments.clone(),
        Arc::new(services.store.clone()),
        std::time::Duration::from_secs(300),
    );
    let (report, replayed) = job.reconcile().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(replayed, 1);
    assert_eq!(
        services.store.payment(payment_id).unwrap().status,
        PaymentStatus::Failed
    );
    assert!(services.store.with_state(|s| s.recon.contains_key(&tenant_id)));
}

#[tokio::test]
async fn test_installment_job_charges_due_plans_once_a_day() {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let staff_user = create_test_user(tenant.id, "plans@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "jo@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let plan = create_test_payment_plan(tenant.id, 2);
    let plan_id = plan.audit.id;
    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let resident_id = resident.audit.id;
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
        s.payment_plans.insert(plan.audit.id, plan);
    });

    let mut line = breakdown_line(dec!(1), dec!(200));
    line.service_taxable = false;
    let bill_id = services
        .billing
        .create(&ctx, &create_test_bill_input(resident_id, None, vec![line]))
        .await
        .unwrap()
        .bill
        .audit
        .id;
    let request = PayRequest {
        payment_plan_id: Some(plan_id),
        ..card_request()
    };
    services
        .plans
        .process_consent(&ctx, bill_id, &request)
        .await
        .unwrap();

    let clock: Arc<dyn Clock> = Arc::new(services.clock.clone());
    let job = InstallmentJob::new(services.plans.clone(), clock);
    let first = job.charge_due().await.unwrap();
    assert_eq!(first.charged, 1);
    assert_eq!(job.charge_due().await.unwrap().due, 0);

    services.clock.advance(Duration::days(31));
    let second = job.charge_due().await.unwrap();
    assert_eq!(second.charged, 1);
    assert_eq!(second.completed_plans, 1);
    assert_eq!(services.store.bill(bill_id).unwrap().paid_amount, dec!(200));
}
