//! Payment-plan installment runner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keystone_services::{Clock, InstallmentReport, PlanManager};

use crate::periodic::PeriodicJob;

/// Plans are charged at most once per day, so an hourly pass only picks up plans that
/// became due since the last one.
const INSTALLMENT_INTERVAL: Duration = Duration::from_secs(3600);

pub struct InstallmentJob {
    plans: PlanManager,
    clock: Arc<dyn Clock>,
}

impl InstallmentJob {
    pub fn new(plans: PlanManager, clock: Arc<dyn Clock>) -> Self {
        Self { plans, clock }
    }

    pub async fn charge_due(&self) -> Result<InstallmentReport> {
        let today = self.clock.now().date_naive();
        let report = self
            .plans
            .run_installments(today)
            .await
            .context("Failed to run installments")?;
        if report.due > 0 {
            tracing::info!(
                %today,
                due = report.due,
                charged = report.charged,
                failed = report.failed,
                deferred = report.deferred,
                completed_plans = report.completed_plans,
                "Installments processed"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for InstallmentJob {
    fn name(&self) -> &'static str {
        "installment_runner"
    }

    fn interval(&self) -> Duration {
        INSTALLMENT_INTERVAL
    }

    async fn run_once(&self) -> Result<()> {
        self.charge_due().await.map(|_| ())
    }
}
