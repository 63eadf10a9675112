//! Database repositories for data access layer
//!
//! Repositories are organized into control/ (tenants, identity, verification codes,
//! authorization, policies, lookups), reservation/ (amenities, slots, bookings), billing/
//! (bills, payment plans, payments, refunds) and notification. Each one implements the
//! matching store trait from [`crate::store_traits`].
//
// Tenancy, identity and authorization repositories
pub mod control;
//
// Amenity reservation repositories
pub mod reservation;
//
// Billing, payment and refund repositories
pub mod billing;
//
// Outbound notification queue
pub mod notification;
//
// for_current_user query scoping
pub mod scope;
//
// Transaction utilities
pub mod transaction;

pub use billing::{PgBillingRepository, PgPaymentRepository, PgRefundRepository};
pub use control::{
    PgAuthzRepository, PgIdentityRepository, PgLookupRepository, PgPolicyRepository,
    PgTenantRepository, PgVerificationRepository,
};
pub use notification::PgNotificationRepository;
pub use reservation::PgReservationRepository;

use keystone_core::AppError;

/// `map_err` adapter: logs the failure and keeps unique-violation mapping.
pub(crate) fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| {
        tracing::error!(error = %e, "{}", context);
        AppError::from(e)
    }
}

/// Zero rows touched by an optimistic update means someone else wrote first.
pub(crate) fn ensure_written(rows: u64, what: &str) -> Result<(), AppError> {
    if rows == 0 {
        return Err(AppError::Conflict(format!(
            "{} was modified concurrently or no longer exists",
            what
        )));
    }
    Ok(())
}
