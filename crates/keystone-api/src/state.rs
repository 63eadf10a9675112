use keystone_services::{
    AuthService, AuthzService, BillingService, OtpService, PaymentService, PlanManager,
    PolicyService, RefundService, ReservationService,
};
use sqlx::PgPool;

/// Shared handler state. Every service is cheap to clone and holds its stores behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub otp: OtpService,
    pub authz: AuthzService,
    pub policies: PolicyService,
    pub reservations: ReservationService,
    pub billing: BillingService,
    pub payments: PaymentService,
    pub plans: PlanManager,
    pub refunds: RefundService,
    /// Absent when the services run over in-memory stores.
    pub pool: Option<PgPool>,
}
