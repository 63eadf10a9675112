//! Gateway reconciliation
//!
//! Payments whose sale call timed out stay PENDING. Each pass asks the gateway about the
//! ones older than the call deadline and, past the cutoff, fails the ones it never saw.
//! It then replays the settlement report for every active tenant.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keystone_db::TenantStore;
use keystone_services::{PaymentService, ReconcileReport};

use crate::periodic::PeriodicJob;

pub struct ReconcileJob {
    payments: PaymentService,
    tenants: Arc<dyn TenantStore>,
    interval: Duration,
}

impl ReconcileJob {
    pub fn new(payments: PaymentService, tenants: Arc<dyn TenantStore>, interval: Duration) -> Self {
        Self {
            payments,
            tenants,
            interval,
        }
    }

    /// Returns the pending-payment report and the number of tenants whose settlement
    /// report was replayed.
    pub async fn reconcile(&self) -> Result<(ReconcileReport, usize)> {
        let report = self
            .payments
            .reconcile_pending()
            .await
            .context("Failed to reconcile pending payments")?;
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                resolved = report.resolved,
                failed = report.failed,
                still_pending = report.still_pending,
                "Pending payments reconciled"
            );
        }

        let tenants = self
            .tenants
            .list_active_tenants()
            .await
            .context("Failed to list tenants")?;
        let mut replayed = 0;
        for tenant in tenants {
            // One tenant's gateway trouble must not hold up the rest.
            match self.payments.reconcile_tenant(tenant.id).await {
                Ok(updated) => {
                    replayed += 1;
                    tracing::debug!(tenant_id = %tenant.id, updated, "Settlement report replayed");
                }
                Err(e) => {
                    tracing::warn!(tenant_id = %tenant.id, error = %e, "Settlement replay failed");
                }
            }
        }
        Ok((report, replayed))
    }
}

#[async_trait]
impl PeriodicJob for ReconcileJob {
    fn name(&self) -> &'static str {
        "gateway_reconciler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<()> {
        self.reconcile().await.map(|_| ())
    }
}
