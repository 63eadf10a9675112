//! Route configuration and setup.
//!
//! Public routes (sign-in, OTP, token refresh, health, docs) sit next to the bearer-token
//! protected domain routes; request id, security headers, rate limiting, tracing and CORS
//! wrap both.

mod health;

use crate::auth::{auth_middleware, AuthFailureLimiter, AuthState};
use crate::constants::{API_PREFIX, OPENAPI_PATH};
use crate::handlers;
use crate::state::AppState;
use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::{get, patch, post},
    Json, Router,
};
use keystone_core::Config;
use keystone_infra::rate_limit::rate_limit_middleware;
use keystone_infra::{request_id_middleware, security_headers_middleware, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const HTTP_CONCURRENCY_LIMIT: usize = 10_000;
const AUTH_FAILURE_LIMIT: u32 = 20;
const AUTH_FAILURE_WINDOW_SECONDS: u64 = 900;

/// Router knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cors_origins: config.cors_origins().to_vec(),
            rate_limit_per_minute: config.http_rate_limit_per_minute(),
        }
    }
}

/// Build the full router over `state` from the application config.
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Router<()> {
    build_router(state, &RouterSettings::from_config(config))
}

pub fn build_router(state: Arc<AppState>, settings: &RouterSettings) -> Router<()> {
    let cors = setup_cors(&settings.cors_origins);
    let rate_limiter = setup_rate_limiter(settings.rate_limit_per_minute);
    let auth_state = Arc::new(AuthState {
        auth: state.auth.clone(),
        failure_limiter: Some(Arc::new(AuthFailureLimiter::new(
            AUTH_FAILURE_LIMIT,
            AUTH_FAILURE_WINDOW_SECONDS,
        ))),
    });

    let protected = protected_routes().layer(axum::middleware::from_fn_with_state(
        auth_state,
        auth_middleware,
    ));

    let app = public_routes()
        .merge(protected)
        .with_state(state)
        .route(OPENAPI_PATH, get(|| async { Json(crate::api_doc::get_openapi_spec()) }))
        .merge(utoipa_rapidoc::RapiDoc::new(OPENAPI_PATH).path("/docs"));

    app.layer(axum::middleware::from_fn_with_state(
        rate_limiter,
        rate_limit_middleware,
    ))
    .layer(ConcurrencyLimitLayer::new(HTTP_CONCURRENCY_LIMIT))
    .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .layer(axum::middleware::from_fn(security_headers_middleware))
    .layer(axum::middleware::from_fn(request_id_middleware))
}

fn route(path: &str) -> String {
    format!("{}{}", API_PREFIX, path)
}

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/live", get(health::liveness_check))
        .route(&route("/auth/login"), post(handlers::auth::login))
        .route(&route("/auth/otp"), post(handlers::auth::otp))
        .route(&route("/auth/refresh"), post(handlers::auth::refresh))
        .route(&route("/auth/logout"), post(handlers::auth::logout))
        .route(
            &route("/auth/reset-password"),
            post(handlers::auth::reset_password),
        )
}

fn protected_routes() -> Router<Arc<AppState>> {
    use handlers::{amenities, bills, policies, refunds, roles};

    Router::new()
        // Roles
        .route(
            &route("/roles"),
            get(roles::list_roles).post(roles::create_role),
        )
        .route(&route("/roles/{id}"), patch(roles::update_role))
        .route(
            &route("/roles/{id}/permissions"),
            get(roles::role_permissions),
        )
        .route(
            &route("/roles/{id}/deactivate"),
            post(roles::deactivate_role),
        )
        // Amenities
        .route(
            &route("/amenity-slots"),
            get(amenities::list_slots).post(amenities::generate_slots),
        )
        .route(&route("/bookings"), post(amenities::create_booking))
        .route(&route("/bookings/{id}"), get(amenities::get_booking))
        .route(
            &route("/bookings/{id}/confirm"),
            post(amenities::confirm_booking),
        )
        .route(
            &route("/bookings/{id}/reject"),
            post(amenities::reject_booking),
        )
        .route(
            &route("/bookings/{id}/cancel"),
            post(amenities::cancel_booking),
        )
        .route(
            &route("/bookings/{id}/duplicate"),
            post(amenities::duplicate_booking),
        )
        .route(
            &route("/bookings/{id}/occurrences"),
            get(amenities::list_occurrences),
        )
        .route(
            &route("/bookings/{id}/exceptions"),
            post(amenities::add_exception),
        )
        // Billing
        .route(&route("/bills"), post(bills::create_bill))
        .route(
            &route("/bills/{id}"),
            get(bills::get_bill).patch(bills::update_bill),
        )
        .route(&route("/bills/{id}/cancel"), post(bills::cancel_bill))
        .route(&route("/bills/{id}/pay"), post(bills::pay_bill))
        .route(
            &route("/bills/{id}/installments"),
            get(bills::upcoming_installments),
        )
        .route(&route("/payments/cancel"), post(bills::cancel_payment))
        // Refunds
        .route(
            &route("/bill-refund-requests"),
            post(refunds::create_refund_request),
        )
        .route(
            &route("/bill-refund-requests/{id}"),
            get(refunds::get_refund_request),
        )
        .route(
            &route("/bill-refund-requests/{id}/process"),
            post(refunds::process_refund_request),
        )
        // Policies
        .route(
            &route("/policies"),
            get(policies::list_policies).post(policies::create_policy),
        )
        .route(
            &route("/policies/acceptance"),
            get(policies::acceptance_status),
        )
        .route(&route("/policies/{id}"), patch(policies::update_policy))
        .route(
            &route("/policies/{id}/accept"),
            post(policies::accept_policy),
        )
}

fn setup_cors(allowed: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let expose = [
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("x-ratelimit-remaining"),
    ];
    if allowed.iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow all origins - not recommended for production");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        let origins: Vec<HeaderValue> = allowed
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(origin) => Some(origin),
                Err(_) => {
                    tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
            .expose_headers(expose)
    }
}

fn setup_rate_limiter(per_minute: u32) -> Arc<RateLimiter> {
    let rate_limiter = Arc::new(RateLimiter::per_minute(per_minute));

    let for_cleanup = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let cleaned = for_cleanup.cleanup_expired().await;
            if cleaned > 0 {
                tracing::debug!(cleaned, "Expired rate limit buckets removed");
            }
        }
    });

    tracing::info!(
        rate_limit_per_minute = per_minute,
        "HTTP rate limiting enabled"
    );
    rate_limiter
}
