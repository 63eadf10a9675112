//! HTTP API integration tests over in-memory stores and the mock gateway.
//!
//! Run with: `cargo test -p keystone-api --test api_test`

mod helpers;

use chrono::Utc;
use helpers::{api_path, setup_test_app, ADMIN_EMAIL, CLERK_EMAIL, RESIDENT_EMAIL};
use keystone_core::models::{AuditEnvelope, Entity, EntityAttributeComposition};
use keystone_core::RequestContext;
use keystone_services::test_helpers::fixtures::{
    breakdown_line, create_test_bill_input, test_card,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_health_reports_in_memory_store() {
    let app = setup_test_app();

    let response = app.client().get("/health").await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "in_memory");
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = setup_test_app();

    let response = app.client().get("/api/openapi.json").await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert!(body["paths"]["/api/v1/bills/{id}/pay"].is_object());
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let app = setup_test_app();

    let response = app.client().get(&api_path("/roles")).await;

    assert_eq!(response.status_code(), 401);
    let body: Value = response.json();
    assert_eq!(body["code"], "unauthorized");
    assert_eq!(body["status_code"], 401);
}

#[tokio::test]
async fn test_login_requires_tenant_header() {
    let app = setup_test_app();

    let response = app
        .client()
        .post(&api_path("/auth/login"))
        .json(&json!({ "username": ADMIN_EMAIL, "password": "Correct-Horse-42" }))
        .await;

    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let app = setup_test_app();

    let response = app
        .client()
        .post(&api_path("/auth/login"))
        .add_header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&json!({ "username": ADMIN_EMAIL, "password": "not-it" }))
        .await;

    assert_eq!(response.status_code(), 401);
    let body: Value = response.json();
    assert_eq!(body["code"], "invalid_credentials");
}

#[tokio::test]
async fn test_login_then_list_roles() {
    let app = setup_test_app();
    let token = app.login(ADMIN_EMAIL).await;

    let response = app
        .client()
        .get(&api_path("/roles"))
        .add_header("Authorization", format!("Bearer {}", token))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert!(body.is_array());
}

#[tokio::test]
async fn test_create_and_pay_bill() {
    let app = setup_test_app();
    let token = app.login(ADMIN_EMAIL).await;

    let mut line = breakdown_line(dec!(2), dec!(60));
    line.service_taxable = false;
    let input = create_test_bill_input(app.resident_id, None, vec![line]);
    let response = app
        .client()
        .post(&api_path("/bills"))
        .add_header("Authorization", format!("Bearer {}", token))
        .json(&input)
        .await;
    assert_eq!(response.status_code(), 201);
    let created: Value = response.json();
    let bill_id = created["bill"]["id"].as_str().expect("bill id").to_string();
    assert!(created["bill"]["display_id"]
        .as_str()
        .is_some_and(|id| id.starts_with("BL-")));

    let response = app
        .client()
        .post(&api_path(&format!("/bills/{}/pay", bill_id)))
        .add_header("Authorization", format!("Bearer {}", token))
        .json(&json!({
            "payment_method": "CREDIT_CARD",
            "card": test_card(),
            "cvv": "123"
        }))
        .await;
    assert_eq!(response.status_code(), 200);
    let paid: Value = response.json();
    assert_eq!(paid["status"], "COMPLETED");

    let bill_uuid: Uuid = bill_id.parse().expect("uuid");
    let bill = app.services.store.bill(bill_uuid).expect("stored bill");
    assert_eq!(bill.paid_amount, dec!(120));
}

#[tokio::test]
async fn test_staff_without_grants_cannot_create_bill() {
    let app = setup_test_app();
    let token = app.login(CLERK_EMAIL).await;

    let input = create_test_bill_input(app.resident_id, None, vec![breakdown_line(dec!(1), dec!(50))]);
    let response = app
        .client()
        .post(&api_path("/bills"))
        .add_header("Authorization", format!("Bearer {}", token))
        .json(&input)
        .await;

    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["code"], "permission_denied");
}

#[tokio::test]
async fn test_resident_cannot_book_for_someone_else() {
    let app = setup_test_app();
    let token = app.login(RESIDENT_EMAIL).await;

    let response = app
        .client()
        .post(&api_path("/bookings"))
        .add_header("Authorization", format!("Bearer {}", token))
        .json(&json!({
            "amenity_id": Uuid::new_v4(),
            "resident_id": Uuid::new_v4(),
            "booking_date": "2030-06-01",
            "start_time": "10:00:00",
            "end_time": "11:00:00"
        }))
        .await;

    assert_eq!(response.status_code(), 403);
}

#[tokio::test]
async fn test_resident_cannot_manage_roles() {
    let app = setup_test_app();
    let token = app.login(RESIDENT_EMAIL).await;

    let response = app
        .client()
        .post(&api_path("/roles"))
        .add_header("Authorization", format!("Bearer {}", token))
        .json(&json!({ "name": "Night desk" }))
        .await;

    assert_eq!(response.status_code(), 403);
}

#[tokio::test]
async fn test_refresh_token_is_not_an_access_token() {
    let app = setup_test_app();
    let login = app
        .client()
        .post(&api_path("/auth/login"))
        .add_header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&json!({ "username": ADMIN_EMAIL, "password": "Correct-Horse-42" }))
        .await;
    let body: Value = login.json();
    let refresh = body["user_tokens"]["refresh"].as_str().expect("refresh token");

    let response = app
        .client()
        .get(&api_path("/roles"))
        .add_header("Authorization", format!("Bearer {}", refresh))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = app
        .client()
        .post(&api_path("/auth/refresh"))
        .json(&json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(response.status_code(), 200);
    let bundle: Value = response.json();
    assert!(bundle["access"].is_string());
}

#[tokio::test]
async fn test_bill_view_omits_ungranted_attributes() {
    let app = setup_test_app();
    let system = RequestContext::system(app.tenant_id);
    let entity = Entity {
        audit: AuditEnvelope::stamp_create_at(&system, Utc::now()),
        name: "bill".to_string(),
    };
    let composition = EntityAttributeComposition {
        audit: AuditEnvelope::stamp_create_at(&system, Utc::now()),
        entity_id: entity.audit.id,
        attribute: "insurance_paid".to_string(),
        display_name: Some("Insurance paid".to_string()),
    };
    app.services.store.with_state(|s| {
        s.entities.push(entity);
        s.attribute_compositions.push(composition);
    });

    let admin = app.login(ADMIN_EMAIL).await;
    let input = create_test_bill_input(app.resident_id, None, vec![breakdown_line(dec!(1), dec!(80))]);
    let response = app
        .client()
        .post(&api_path("/bills"))
        .add_header("Authorization", format!("Bearer {}", admin))
        .json(&input)
        .await;
    assert_eq!(response.status_code(), 201);
    let created: Value = response.json();
    let bill_path = api_path(&format!(
        "/bills/{}",
        created["bill"]["id"].as_str().expect("bill id")
    ));

    let resident = app.login(RESIDENT_EMAIL).await;
    let response = app
        .client()
        .get(&bill_path)
        .add_header("Authorization", format!("Bearer {}", resident))
        .await;
    assert_eq!(response.status_code(), 200);
    let seen: Value = response.json();
    assert!(seen["bill"].get("insurance_paid").is_none());
    assert!(seen["bill"].get("total_charges").is_some());

    let response = app
        .client()
        .get(&bill_path)
        .add_header("Authorization", format!("Bearer {}", admin))
        .await;
    let full: Value = response.json();
    assert!(full["bill"].get("insurance_paid").is_some());
}
