use chrono::Utc;
use keystone_core::models::{AuditEnvelope, BillCancellationCodeComposition, BillStatus};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
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
    let staff_user = create_test_user(tenant.id, "billing@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "carol@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let tax = create_test_tax_rule(tenant.id, "CA", dec!(10));
    let cancel_code = BillCancellationCodeComposition {
        audit: AuditEnvelope::stamp_create_at(&RequestContext::system(tenant.id), Utc::now()),
        cancellation_reason: "Duplicate bill".to_string(),
        cancellation_code: "DUP".to_string(),
    };

    let ctx = staff_context(tenant.id, staff_user.audit.id);
    let (resident_id, resident_user_id) = (resident.audit.id, resident_user.audit.id);
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
        s.tax_rules.push(tax);
        s.cancellation_codes.push(cancel_code);
    });
    Seeded {
        services,
        ctx,
        resident_id,
        resident_user_id,
    }
}

#[tokio::test]
async fn test_bill_totals_with_discount_and_state_tax() {
    let seeded = seed();
    let mut input = create_test_bill_input(
        seeded.resident_id,
        None,
        vec![breakdown_line(dec!(2), dec!(100))],
    );
    input.discounts = vec![percent_rule("Loyalty", dec!(10))];

    let aggregate = seeded.services.billing.create(&seeded.ctx, &input).await.unwrap();
    let bill = &aggregate.bill;

    assert_eq!(bill.total_charges, dec!(200));
    assert_eq!(bill.other_discount, dec!(20));
    assert_eq!(bill.other_tax, dec!(18));
    assert_eq!(bill.patient_amount, dec!(198));
    assert_eq!(bill.status, BillStatus::Pending);
    assert_eq!(bill.currency, "USD");
    assert!(bill.display_id.starts_with("BL-"));
    assert_eq!(aggregate.breakdowns.len(), 1);
    assert!(!aggregate.summaries.is_empty());
}

#[tokio::test]
async fn test_bill_without_tax_state_is_untaxed() {
    let seeded = seed();
    let mut input = create_test_bill_input(
        seeded.resident_id,
        None,
        vec![breakdown_line(dec!(1), dec!(80))],
    );
    input.tax_state = None;

    let aggregate = seeded.services.billing.create(&seeded.ctx, &input).await.unwrap();
    assert_eq!(aggregate.bill.other_tax, dec!(0));
    assert_eq!(aggregate.bill.patient_amount, dec!(80));
}

#[tokio::test]
async fn test_update_recalculates_and_keeps_resident() {
    let seeded = seed();
    let input = create_test_bill_input(
        seeded.resident_id,
        None,
        vec![breakdown_line(dec!(1), dec!(100))],
    );
    let created = seeded.services.billing.create(&seeded.ctx, &input).await.unwrap();
    let bill_id = created.bill.audit.id;

    let mut changed = input.clone();
    changed.breakdown = vec![breakdown_line(dec!(3), dec!(50))];
    let updated = seeded
        .services
        .billing
        .update(&seeded.ctx, bill_id, &changed)
        .await
        .unwrap();
    assert_eq!(updated.bill.total_charges, dec!(150));
    assert_eq!(updated.bill.patient_amount, dec!(165));
    assert_eq!(updated.breakdowns.len(), 1);

    let mut moved = input;
    moved.resident_id = Uuid::new_v4();
    let result = seeded.services.billing.update(&seeded.ctx, bill_id, &moved).await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
}

#[tokio::test]
async fn test_cancel_maps_reason_to_code() {
    let seeded = seed();
    let input = create_test_bill_input(
        seeded.resident_id,
        None,
        vec![breakdown_line(dec!(1), dec!(100))],
    );
    let bill_id = seeded
        .services
        .billing
        .create(&seeded.ctx, &input)
        .await
        .unwrap()
        .bill
        .audit
        .id;

    let unknown = seeded
        .services
        .billing
        .cancel(&seeded.ctx, bill_id, "Changed my mind")
        .await;
    assert!(matches!(unknown, Err(AppError::InvalidInput(_))));

    let cancelled = seeded
        .services
        .billing
        .cancel(&seeded.ctx, bill_id, "Duplicate bill")
        .await
        .unwrap();
    assert_eq!(cancelled.status, BillStatus::Cancelled);
    assert_eq!(cancelled.cancellation_code.as_deref(), Some("DUP"));

    let again = seeded
        .services
        .billing
        .cancel(&seeded.ctx, bill_id, "Duplicate bill")
        .await;
    assert!(matches!(again, Err(AppError::InvalidStatusForCancellation(_))));
}

#[tokio::test]
async fn test_bill_visibility_follows_scope() {
    let seeded = seed();
    let location = Uuid::new_v4();
    let input = create_test_bill_input(
        seeded.resident_id,
        Some(location),
        vec![breakdown_line(dec!(1), dec!(100))],
    );
    let bill_id = seeded
        .services
        .billing
        .create(&seeded.ctx, &input)
        .await
        .unwrap()
        .bill
        .audit
        .id;
    let billing = &seeded.services.billing;
    let tenant_id = seeded.ctx.tenant_id;

    let in_scope = location_staff_context(tenant_id, vec![location]);
    billing.get(&in_scope, bill_id).await.unwrap();

    let out_of_scope = location_staff_context(tenant_id, vec![Uuid::new_v4()]);
    let hidden = billing.get(&out_of_scope, bill_id).await;
    assert!(matches!(hidden, Err(AppError::NotFound(_))));

    let owner = resident_context(tenant_id, seeded.resident_user_id, seeded.resident_id);
    billing.get(&owner, bill_id).await.unwrap();

    let stranger = resident_context(tenant_id, Uuid::new_v4(), Uuid::new_v4());
    let hidden = billing.get(&stranger, bill_id).await;
    assert!(matches!(hidden, Err(AppError::NotFound(_))));

    let other_tenant = staff_context(Uuid::new_v4(), Uuid::new_v4());
    let hidden = billing.get(&other_tenant, bill_id).await;
    assert!(matches!(hidden, Err(AppError::NotFound(_))));
}
