//! Service initialization

use crate::state::AppState;
use anyhow::{Context, Result};
use keystone_core::{Config, EncryptionService};
use keystone_db::{
    AuthzStore, BillingStore, IdentityStore, LookupStore, NotificationStore, PaymentStore,
    PgAuthzRepository, PgBillingRepository, PgIdentityRepository, PgLookupRepository,
    PgNotificationRepository, PgPaymentRepository, PgPolicyRepository, PgRefundRepository,
    PgReservationRepository, PgTenantRepository, PgVerificationRepository, PolicyStore,
    RefundStore, ReservationStore, TenantStore, VerificationStore,
};
use keystone_services::{
    AuthService, AuthzService, BillingService, Clock, HttpGateway, InstrumentVault, MockGateway,
    NoopRenderer, Notifier, OtpService, PaymentGateway, PaymentService, PlanManager,
    PolicyService, RefundService, ReservationService, SystemClock, TokenService,
};
use keystone_worker::WorkerContext;
use sqlx::PgPool;
use std::sync::Arc;

/// Base URL value that selects the in-process gateway simulator.
const MOCK_GATEWAY: &str = "mock";

/// Wire the Postgres repositories into the services. The worker context shares the same
/// stores and services as the HTTP state.
pub fn initialize_services(
    config: &Config,
    pool: PgPool,
) -> Result<(Arc<AppState>, WorkerContext)> {
    tracing::info!("Initializing repositories");

    let tenants: Arc<dyn TenantStore> = Arc::new(PgTenantRepository::new(pool.clone()));
    let identity: Arc<dyn IdentityStore> = Arc::new(PgIdentityRepository::new(pool.clone()));
    let verification: Arc<dyn VerificationStore> =
        Arc::new(PgVerificationRepository::new(pool.clone()));
    let authz_store: Arc<dyn AuthzStore> = Arc::new(PgAuthzRepository::new(pool.clone()));
    let policy_store: Arc<dyn PolicyStore> = Arc::new(PgPolicyRepository::new(pool.clone()));
    let reservation_store: Arc<dyn ReservationStore> =
        Arc::new(PgReservationRepository::new(pool.clone()));
    let bills: Arc<dyn BillingStore> = Arc::new(PgBillingRepository::new(pool.clone()));
    let lookups: Arc<dyn LookupStore> = Arc::new(PgLookupRepository::new(pool.clone()));
    let payment_store: Arc<dyn PaymentStore> = Arc::new(PgPaymentRepository::new(pool.clone()));
    let refund_store: Arc<dyn RefundStore> = Arc::new(PgRefundRepository::new(pool.clone()));
    let notification_store: Arc<dyn NotificationStore> =
        Arc::new(PgNotificationRepository::new(pool.clone()));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier = Notifier::new(notification_store.clone(), clock.clone());
    let tokens = TokenService::new(config.auth().clone());

    let encryption = EncryptionService::from_env()
        .context("Failed to initialize instrument encryption (ENCRYPTION_KEY)")?;
    let vault = InstrumentVault::new(payment_store.clone(), encryption);
    let gateway = setup_gateway(config)?;

    let auth = AuthService::new(
        tenants.clone(),
        identity.clone(),
        verification.clone(),
        tokens.clone(),
        clock.clone(),
    );
    let otp = OtpService::new(
        identity.clone(),
        verification,
        notifier.clone(),
        tokens,
        clock.clone(),
    );
    let authz = AuthzService::new(authz_store, identity.clone());
    let policies = PolicyService::new(policy_store, Arc::new(NoopRenderer), clock.clone());
    let reservations = ReservationService::new(
        reservation_store,
        notifier.clone(),
        clock.clone(),
        config.recurrence_horizon_days(),
    );
    let billing = BillingService::new(tenants.clone(), bills.clone(), lookups, clock.clone());
    let payments = PaymentService::new(
        bills.clone(),
        payment_store.clone(),
        gateway.clone(),
        vault.clone(),
        notifier.clone(),
        clock.clone(),
        config.gateway().clone(),
    );
    let plans = PlanManager::new(
        bills.clone(),
        payment_store.clone(),
        gateway.clone(),
        vault,
        notifier.clone(),
        clock.clone(),
    );
    let refunds = RefundService::new(
        bills,
        payment_store,
        refund_store,
        gateway,
        notifier,
        clock.clone(),
    );

    let worker = WorkerContext {
        notifications: notification_store,
        identity,
        tenants,
        payments: payments.clone(),
        plans: plans.clone(),
        clock,
    };

    let state = Arc::new(AppState {
        auth,
        otp,
        authz,
        policies,
        reservations,
        billing,
        payments,
        plans,
        refunds,
        pool: Some(pool),
    });

    tracing::info!("Services initialized");
    Ok((state, worker))
}

fn setup_gateway(config: &Config) -> Result<Arc<dyn PaymentGateway>> {
    let settings = config.gateway();
    if settings.base_url.eq_ignore_ascii_case(MOCK_GATEWAY) {
        tracing::warn!("Using the in-process mock payment gateway");
        return Ok(Arc::new(MockGateway::new()));
    }
    let gateway = HttpGateway::new(settings.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialize payment gateway: {}", e))?;
    tracing::info!(base_url = %settings.base_url, "Payment gateway configured");
    Ok(Arc::new(gateway))
}
