//! Test helpers for service tests
//!
//! An in-memory implementation of every store trait, a settable clock and fixtures, so the
//! services can be exercised without a database or a live gateway.

pub mod fixtures;
pub mod memory_store;

pub use fixtures::*;
pub use memory_store::{MemoryState, MemoryStore};

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use keystone_core::{AuthSettings, EncryptionService, GatewaySettings};

use crate::auth::{AuthService, TokenService};
use crate::authz::AuthzService;
use crate::billing::BillingService;
use crate::clock::Clock;
use crate::gateway::MockGateway;
use crate::notifier::Notifier;
use crate::otp::OtpService;
use crate::payment::{InstrumentVault, PaymentService};
use crate::plan::PlanManager;
use crate::policy::{NoopRenderer, PolicyService};
use crate::refund::RefundService;
use crate::reservation::ReservationService;

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub const TEST_JWT_SECRET: &str = "keystone-test-secret-that-is-long-enough";

pub fn test_auth_settings() -> AuthSettings {
    AuthSettings {
        jwt_secret: TEST_JWT_SECRET.to_string(),
        ..AuthSettings::default()
    }
}

pub fn test_encryption() -> EncryptionService {
    EncryptionService::from_key_bytes(&[7u8; 32]).expect("test encryption key")
}

/// Every service wired to one [`MemoryStore`], a [`MockGateway`] and a [`MockClock`].
#[derive(Clone)]
pub struct TestServices {
    pub store: MemoryStore,
    pub gateway: Arc<MockGateway>,
    pub clock: MockClock,
    pub notifier: Notifier,
    pub auth: AuthService,
    pub otp: OtpService,
    pub authz: AuthzService,
    pub policies: PolicyService,
    pub reservations: ReservationService,
    pub billing: BillingService,
    pub payments: PaymentService,
    pub plans: PlanManager,
    pub refunds: RefundService,
}

impl TestServices {
    pub fn new(now: DateTime<Utc>) -> Self {
        let store = MemoryStore::new();
        let shared = Arc::new(store.clone());
        let gateway = Arc::new(MockGateway::new());
        let clock = MockClock::new(now);
        let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
        let tokens = TokenService::new(test_auth_settings());
        let notifier = Notifier::new(shared.clone(), clock_dyn.clone());
        let vault = InstrumentVault::new(shared.clone(), test_encryption());

        Self {
            auth: AuthService::new(
                shared.clone(),
                shared.clone(),
                shared.clone(),
                tokens.clone(),
                clock_dyn.clone(),
            ),
            otp: OtpService::new(
                shared.clone(),
                shared.clone(),
                notifier.clone(),
                tokens,
                clock_dyn.clone(),
            ),
            authz: AuthzService::new(shared.clone(), shared.clone()),
            policies: PolicyService::new(shared.clone(), Arc::new(NoopRenderer), clock_dyn.clone()),
            reservations: ReservationService::new(
                shared.clone(),
                notifier.clone(),
                clock_dyn.clone(),
                90,
            ),
            billing: BillingService::new(
                shared.clone(),
                shared.clone(),
                shared.clone(),
                clock_dyn.clone(),
            ),
            payments: PaymentService::new(
                shared.clone(),
                shared.clone(),
                gateway.clone(),
                vault.clone(),
                notifier.clone(),
                clock_dyn.clone(),
                GatewaySettings::default(),
            ),
            plans: PlanManager::new(
                shared.clone(),
                shared.clone(),
                gateway.clone(),
                vault,
                notifier.clone(),
                clock_dyn.clone(),
            ),
            refunds: RefundService::new(
                shared.clone(),
                shared.clone(),
                shared,
                gateway.clone(),
                notifier.clone(),
                clock_dyn,
            ),
            store,
            gateway,
            clock,
            notifier,
        }
    }
}

/// Transport that records what it was asked to send, failing the first `failures` sends.
#[derive(Clone)]
pub struct RecordingTransport {
    channel: keystone_core::models::NotificationChannel,
    sent: Arc<Mutex<Vec<crate::notifier::RenderedMessage>>>,
    failures: Arc<Mutex<u32>>,
}

impl RecordingTransport {
    pub fn new(channel: keystone_core::models::NotificationChannel) -> Self {
        Self {
            channel,
            sent: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(0)),
        }
    }

    pub fn fail_next(&self, failures: u32) {
        *self.failures.lock().unwrap() = failures;
    }

    pub fn sent(&self) -> Vec<crate::notifier::RenderedMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl crate::notifier::NotificationTransport for RecordingTransport {
    fn channel(&self) -> keystone_core::models::NotificationChannel {
        self.channel
    }

    async fn send(
        &self,
        message: &crate::notifier::RenderedMessage,
    ) -> keystone_core::AppResult<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(keystone_core::AppError::Internal(
                    "transport unavailable".to_string(),
                ));
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
