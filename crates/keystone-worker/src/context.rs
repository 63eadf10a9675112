//! Worker context
//!
//! The API bootstrap builds one [`WorkerContext`] from the same stores and services it
//! serves requests with, then calls [`WorkerContext::spawn`].

use std::sync::Arc;
use std::time::Duration;

use keystone_core::Config;
use keystone_db::{IdentityStore, NotificationStore, TenantStore};
use keystone_services::{Clock, NotificationTransport, PaymentService, PlanManager};

use crate::delivery::{DeliveryConfig, NotificationDispatcher};
use crate::installments::InstallmentJob;
use crate::periodic::{PeriodicJob, WorkerHandle};
use crate::reconciler::ReconcileJob;

#[derive(Clone)]
pub struct WorkerContext {
    pub notifications: Arc<dyn NotificationStore>,
    pub identity: Arc<dyn IdentityStore>,
    pub tenants: Arc<dyn TenantStore>,
    pub payments: PaymentService,
    pub plans: PlanManager,
    pub clock: Arc<dyn Clock>,
}

impl WorkerContext {
    pub fn jobs(
        &self,
        config: &Config,
        transports: Vec<Arc<dyn NotificationTransport>>,
    ) -> Vec<Arc<dyn PeriodicJob>> {
        let delivery = NotificationDispatcher::new(
            self.notifications.clone(),
            self.identity.clone(),
            transports,
            self.clock.clone(),
            DeliveryConfig {
                poll_interval_ms: config.notification_poll_interval_ms(),
                max_retries: config.notification_max_retries(),
                ..DeliveryConfig::default()
            },
        );
        let reconcile = ReconcileJob::new(
            self.payments.clone(),
            self.tenants.clone(),
            Duration::from_secs(config.gateway().reconcile_interval_seconds.max(1)),
        );
        let installments = InstallmentJob::new(self.plans.clone(), self.clock.clone());

        vec![
            Arc::new(delivery),
            Arc::new(reconcile),
            Arc::new(installments),
        ]
    }

    pub fn spawn(
        &self,
        config: &Config,
        transports: Vec<Arc<dyn NotificationTransport>>,
    ) -> WorkerHandle {
        WorkerHandle::spawn(self.jobs(config, transports))
    }
}
