//! Keystone Services Layer
//!
//! Orchestration over the store traits of `keystone-db`: sign-in and sessions, OTP,
//! authorization administration, policies, the amenity reservation engine, billing, the
//! payment gateway adapter, payment plans and refunds. Handlers in `keystone-api` and loops
//! in `keystone-worker` call into this crate; pure rules stay in `keystone-core`.

pub mod audit;
pub mod auth;
pub mod authz;
pub mod billing;
pub mod clock;
pub mod gateway;
pub mod notifier;
pub mod otp;
pub mod payment;
pub mod plan;
pub mod policy;
pub mod refund;
pub mod reservation;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use auth::{
    AuthService, LoginRequest, LoginResponse, TokenBundle, TokenClaims, TokenService, TokenType,
};
pub use authz::{AuthzService, NewRole};
pub use billing::BillingService;
pub use clock::{Clock, SystemClock};
pub use gateway::{
    ConsentTerms, GatewayExchange, GatewayResponse, GatewayTransaction, HttpGateway, MockGateway,
    PaymentGateway, QueryResponse, ReconcileQuery, ReconcileResponse, RefundResponse,
};
pub use notifier::{LogTransport, NotificationTransport, Notifier, RenderedMessage};
pub use otp::{OtpAction, OtpRequest, OtpResponse, OtpService};
pub use payment::{Instrument, InstrumentVault, PaymentService, ReconcileReport};
pub use plan::{InstallmentReport, PlanManager};
pub use policy::{NewPolicy, NoopRenderer, PolicyRenderer, PolicyService};
pub use refund::{RefundRequestView, RefundService};
pub use reservation::{DuplicateBooking, NewException, RejectBooking, ReservationService};
