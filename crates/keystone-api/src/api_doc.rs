//! OpenAPI documentation, served at [`crate::constants::OPENAPI_PATH`] and browsable under
//! `/docs`.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::handlers;
use keystone_infra::ErrorResponse;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Keystone API",
        version = "0.1.0",
        description = "Multi-tenant property management: sign-in and roles, amenity reservations, billing, payments, payment plans and refunds. All endpoints are versioned under /api/v1/ and authenticated with a bearer access token unless noted."
    ),
    paths(
        // Auth
        handlers::auth::login,
        handlers::auth::otp,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::reset_password,
        // Roles
        handlers::roles::list_roles,
        handlers::roles::create_role,
        handlers::roles::role_permissions,
        handlers::roles::update_role,
        handlers::roles::deactivate_role,
        // Amenities
        handlers::amenities::generate_slots,
        handlers::amenities::list_slots,
        handlers::amenities::create_booking,
        handlers::amenities::get_booking,
        handlers::amenities::confirm_booking,
        handlers::amenities::reject_booking,
        handlers::amenities::cancel_booking,
        handlers::amenities::duplicate_booking,
        handlers::amenities::list_occurrences,
        handlers::amenities::add_exception,
        // Billing
        handlers::bills::create_bill,
        handlers::bills::get_bill,
        handlers::bills::update_bill,
        handlers::bills::cancel_bill,
        handlers::bills::pay_bill,
        handlers::bills::upcoming_installments,
        handlers::bills::cancel_payment,
        // Refunds
        handlers::refunds::create_refund_request,
        handlers::refunds::get_refund_request,
        handlers::refunds::process_refund_request,
        // Policies
        handlers::policies::list_policies,
        handlers::policies::create_policy,
        handlers::policies::update_policy,
        handlers::policies::accept_policy,
        handlers::policies::acceptance_status,
    ),
    components(schemas(ErrorResponse)),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Sign-in, OTP and session tokens"),
        (name = "roles", description = "Roles and module permissions"),
        (name = "amenities", description = "Amenity slots and bookings"),
        (name = "billing", description = "Bills, payments and payment plans"),
        (name = "refunds", description = "Bill refund requests"),
        (name = "policies", description = "Policies and acceptance")
    )
)]
pub struct ApiDoc;

pub fn get_openapi_spec() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_versioned_paths() {
        let spec = get_openapi_spec();
        assert!(spec.paths.paths.contains_key("/api/v1/auth/login"));
        assert!(spec.paths.paths.contains_key("/api/v1/bills/{id}/pay"));
        assert!(spec
            .paths
            .paths
            .keys()
            .all(|path| path.starts_with(crate::constants::API_PREFIX)));
    }
}
