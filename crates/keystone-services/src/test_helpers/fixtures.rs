//! Test fixtures and helper functions for creating test data

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use keystone_core::models::{
    AccessLevel, Amenity, AmenitySlot, AuditEnvelope, BillInput, BreakdownInput, CardDetails,
    Payment, PaymentMethod, PaymentPlan, PaymentPlanKind, PaymentStatus, ProfileType, Resident,
    RuleSpec, RuleType, Staff, TaxPerState, Tenant, TenantStatus, TransactionType, User,
    UserStatus, UserType,
};
use keystone_core::RequestContext;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::auth::password::hash_password;

pub const TEST_PASSWORD: &str = "Correct-Horse-42";

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("fixture date")
}

pub fn time(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").expect("fixture time")
}

pub fn instant(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("fixture instant")
        .with_timezone(&Utc)
}

fn envelope(tenant_id: Uuid, at: DateTime<Utc>) -> AuditEnvelope {
    AuditEnvelope::stamp_create_at(&RequestContext::system(tenant_id), at)
}

/// Create an active tenant with the given lockout limit and a 15 minute window.
pub fn create_test_tenant(lockout_limit: i32) -> Tenant {
    let now = Utc::now();
    Tenant {
        id: Uuid::new_v4(),
        name: "Harbor View Residences".to_string(),
        status: TenantStatus::Active,
        lockout_limit,
        lockout_window_seconds: 900,
        default_currency: "USD".to_string(),
        state: Some("CA".to_string()),
        created_on: now,
        updated_on: now,
    }
}

/// Create a user whose password is [`TEST_PASSWORD`].
pub fn create_test_user(tenant_id: Uuid, email: &str, is_staff: bool) -> User {
    User {
        audit: envelope(tenant_id, Utc::now()),
        email: Some(email.to_string()),
        username: email.to_string(),
        password_hash: Some(hash_password(TEST_PASSWORD).expect("hash fixture password")),
        is_active: true,
        is_superuser: false,
        is_staff,
        access_level: if is_staff {
            AccessLevel::Admin
        } else {
            AccessLevel::Unit
        },
        first_name: Some("Alice".to_string()),
        last_name: Some("Moreno".to_string()),
        phone: Some("5550100".to_string()),
        country_code: Some("+1".to_string()),
        date_of_birth: None,
        status: UserStatus::Approved,
        locked: false,
        failed_attempt_count: 0,
        locked_at: None,
        languages: vec!["en".to_string()],
    }
}

pub fn create_test_staff(tenant_id: Uuid, user_id: Uuid, role_ids: Vec<Uuid>) -> Staff {
    Staff {
        audit: envelope(tenant_id, Utc::now()),
        user_id,
        role_ids,
        scope_ids: Vec::new(),
        active: true,
    }
}

pub fn create_test_resident(tenant_id: Uuid, user_id: Uuid) -> Resident {
    Resident {
        audit: envelope(tenant_id, Utc::now()),
        user_id,
        resident_code: "R-0001".to_string(),
        profile_type: ProfileType::Tenant,
        role_ids: Vec::new(),
        scope_ids: Vec::new(),
    }
}

/// Admin-level staff caller.
pub fn staff_context(tenant_id: Uuid, user_id: Uuid) -> RequestContext {
    RequestContext {
        tenant_id,
        user_id,
        user_type: UserType::Staff,
        access_level: AccessLevel::Admin,
        staff_id: Some(Uuid::new_v4()),
        resident_id: None,
        scope_ids: Vec::new(),
        is_superuser: false,
        request_id: None,
    }
}

/// Staff caller bound to specific scope nodes at location level.
pub fn location_staff_context(tenant_id: Uuid, scope_ids: Vec<Uuid>) -> RequestContext {
    RequestContext {
        access_level: AccessLevel::Location,
        scope_ids,
        ..staff_context(tenant_id, Uuid::new_v4())
    }
}

pub fn resident_context(tenant_id: Uuid, user_id: Uuid, resident_id: Uuid) -> RequestContext {
    RequestContext {
        tenant_id,
        user_id,
        user_type: UserType::Resident,
        access_level: AccessLevel::Unit,
        staff_id: None,
        resident_id: Some(resident_id),
        scope_ids: Vec::new(),
        is_superuser: false,
        request_id: None,
    }
}

pub fn create_test_amenity(tenant_id: Uuid, location_id: Option<Uuid>) -> Amenity {
    Amenity {
        audit: envelope(tenant_id, Utc::now()),
        name: "Rooftop Pool".to_string(),
        location_id,
        active: true,
    }
}

pub fn create_test_slot(
    tenant_id: Uuid,
    amenity_id: Uuid,
    slot_date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    max_concurrent_bookings: i32,
) -> AmenitySlot {
    AmenitySlot {
        audit: envelope(tenant_id, Utc::now()),
        amenity_id,
        slot_date,
        slot_start_time: start,
        slot_end_time: end,
        slot_duration_minutes: (end - start).num_minutes() as i32,
        is_available: true,
        total_bookings: 0,
        max_concurrent_bookings,
    }
}

pub fn create_test_tax_rule(tenant_id: Uuid, state: &str, percent: Decimal) -> TaxPerState {
    TaxPerState {
        audit: envelope(tenant_id, Utc::now()),
        state: state.to_string(),
        tax_type: RuleType::Percent,
        value: percent,
        max_upto: None,
        active: true,
        start_date: None,
        end_date: None,
    }
}

pub fn breakdown_line(quantity: Decimal, unit_amount: Decimal) -> BreakdownInput {
    BreakdownInput {
        category: "Amenities".to_string(),
        type_of_service: "Clubhouse rental".to_string(),
        description: None,
        unit_amount,
        service_taxable: true,
        quantity,
        insurance_amount: Decimal::ZERO,
        other_fees: Decimal::ZERO,
        other_fees_taxable: false,
        adjustments: Vec::new(),
        discounts: Vec::new(),
        writeoffs: Vec::new(),
        currency: None,
        service_start_date: None,
        service_end_date: None,
    }
}

pub fn percent_rule(name: &str, value: Decimal) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        rule_type: RuleType::Percent,
        value,
        max_upto: None,
        taxable: true,
        direction: None,
    }
}

pub fn create_test_bill_input(
    resident_id: Uuid,
    location_id: Option<Uuid>,
    lines: Vec<BreakdownInput>,
) -> BillInput {
    let today = Utc::now().date_naive();
    BillInput {
        resident_id,
        location_id,
        service_description: Some("Clubhouse booking".to_string()),
        service_date: today,
        statement_date: today,
        due_date: today + chrono::Duration::days(30),
        tax_state: Some("CA".to_string()),
        breakdown: lines,
        adjustments: Vec::new(),
        discounts: Vec::new(),
        writeoffs: Vec::new(),
    }
}

pub fn create_test_payment_plan(tenant_id: Uuid, duration: i32) -> PaymentPlan {
    PaymentPlan {
        audit: envelope(tenant_id, Utc::now()),
        name: format!("{} month plan", duration),
        duration,
        interest_rate: Decimal::ZERO,
        type_of_interest: RuleType::Percent,
        other_fees: Decimal::ZERO,
        type_processing_fee: RuleType::Flat,
        interest_taxable: false,
        other_fees_taxable: false,
        start_date: None,
        end_date: None,
        active: true,
    }
}

pub fn test_card() -> CardDetails {
    CardDetails {
        number: "4111111111111111".to_string(),
        expiry_month: 12,
        expiry_year: 2030,
        holder_name: Some("Alice Moreno".to_string()),
        brand: Some("VISA".to_string()),
    }
}

/// A completed card payment against `bill_id`, created at `created_on`.
pub fn create_completed_payment(
    tenant_id: Uuid,
    bill_id: Uuid,
    amount: Decimal,
    transaction_id: &str,
    created_on: DateTime<Utc>,
) -> Payment {
    let audit = envelope(tenant_id, created_on);
    Payment {
        order_id: audit.id.to_string(),
        audit,
        bill_id,
        parent_id: None,
        refund_request_id: None,
        transaction_type: TransactionType::Payment,
        amount,
        refund_amount: Decimal::ZERO,
        currency: "USD".to_string(),
        method: PaymentMethod::CreditCard,
        status: PaymentStatus::Completed,
        gateway_status: None,
        transaction_id: Some(transaction_id.to_string()),
        extra_data: serde_json::Value::Null,
        installment_date: None,
        payment_term: None,
        payment_plan: PaymentPlanKind::Full,
        processed_on: Some(created_on),
    }
}
