//! Keystone Database Layer
//!
//! Postgres repositories behind the store traits the service layer is written against,
//! plus the embedded schema migrations.
//!
// Module declarations
pub mod db;
pub mod store_traits;

// Re-exports: Postgres repositories
pub use db::{
    PgAuthzRepository, PgBillingRepository, PgIdentityRepository, PgLookupRepository,
    PgNotificationRepository, PgPaymentRepository, PgPolicyRepository, PgRefundRepository,
    PgReservationRepository, PgTenantRepository, PgVerificationRepository,
};

// Re-exports: Store traits
pub use store_traits::{
    AuthzStore, BillingStore, IdentityStore, LookupStore, NotificationStore, PaymentStore,
    PolicyStore, RefundStore, ReservationStore, TenantStore, VerificationStore,
};

// Re-exports: Transaction utilities
pub use db::transaction::{begin_serializable, commit, retry_on_contention};

/// Schema migrations, applied at startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
