//! Test helpers: build the router over in-memory services for integration tests.
//!
//! Run from workspace root: `cargo test -p keystone-api`.

use axum_test::TestServer;
use chrono::Utc;
use keystone_api::constants;
use keystone_api::setup::routes::{build_router, RouterSettings};
use keystone_api::state::AppState;
use keystone_services::test_helpers::fixtures::{
    create_test_resident, create_test_staff, create_test_tenant, create_test_user, TEST_PASSWORD,
};
use keystone_services::test_helpers::TestServices;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// API path prefix for tests (e.g. `/api/v1`).
pub fn api_path(path: &str) -> String {
    format!("{}{}", constants::API_PREFIX, path)
}

pub const ADMIN_EMAIL: &str = "admin@harborview.test";
pub const CLERK_EMAIL: &str = "clerk@harborview.test";
pub const RESIDENT_EMAIL: &str = "dana@harborview.test";

/// Test application: server plus the in-memory services behind it.
pub struct TestApp {
    pub server: TestServer,
    pub services: TestServices,
    pub tenant_id: Uuid,
    /// Resident profile of [`RESIDENT_EMAIL`].
    pub resident_id: Uuid,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    /// Sign in and return the access token.
    pub async fn login(&self, email: &str) -> String {
        let response = self
            .server
            .post(&api_path("/auth/login"))
            .add_header("X-Tenant-ID", self.tenant_id.to_string())
            .json(&json!({ "username": email, "password": TEST_PASSWORD }))
            .await;
        assert_eq!(response.status_code(), 200, "login failed for {}", email);
        let body: Value = response.json();
        body["user_tokens"]["access"]
            .as_str()
            .expect("access token in login response")
            .to_string()
    }
}

/// One tenant with a superuser admin, a staff clerk without roles and a resident.
pub fn setup_test_app() -> TestApp {
    // Tokens are checked against wall-clock time.
    let services = TestServices::new(Utc::now());

    let tenant = create_test_tenant(5);
    let tenant_id = tenant.id;
    let mut admin = create_test_user(tenant_id, ADMIN_EMAIL, true);
    admin.is_superuser = true;
    let clerk = create_test_user(tenant_id, CLERK_EMAIL, true);
    let clerk_staff = create_test_staff(tenant_id, clerk.audit.id, Vec::new());
    let resident_user = create_test_user(tenant_id, RESIDENT_EMAIL, false);
    let resident = create_test_resident(tenant_id, resident_user.audit.id);
    let resident_id = resident.audit.id;

    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(admin.audit.id, admin);
        s.users.insert(clerk.audit.id, clerk);
        s.staff.insert(clerk_staff.audit.id, clerk_staff);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });

    let state = Arc::new(AppState {
        auth: services.auth.clone(),
        otp: services.otp.clone(),
        authz: services.authz.clone(),
        policies: services.policies.clone(),
        reservations: services.reservations.clone(),
        billing: services.billing.clone(),
        payments: services.payments.clone(),
        plans: services.plans.clone(),
        refunds: services.refunds.clone(),
        pool: None,
    });
    let settings = RouterSettings {
        cors_origins: vec!["*".to_string()],
        rate_limit_per_minute: 10_000,
    };
    let server = TestServer::new(build_router(state, &settings)).expect("test server");

    TestApp {
        server,
        services,
        tenant_id,
        resident_id,
    }
}
