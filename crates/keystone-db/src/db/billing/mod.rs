//! Billing repositories: bills with their calculated rows, payment plans, payments and
//! refund requests.

mod bill;
mod payment;
mod refund;

pub use bill::PgBillingRepository;
pub use payment::PgPaymentRepository;
pub use refund::PgRefundRepository;
