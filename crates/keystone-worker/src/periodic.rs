//! Interval-driven jobs with a shared shutdown signal.
//!
//! Shutdown: [`WorkerHandle::shutdown`] signals every loop and waits for the current pass
//! of each job to finish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One pass. Errors are logged and the loop continues on the next tick.
    async fn run_once(&self) -> Result<()>;
}

pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(jobs: Vec<Arc<dyn PeriodicJob>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = jobs
            .into_iter()
            .map(|job| tokio::spawn(run_loop(job, shutdown_rx.clone())))
            .collect();
        Self {
            shutdown_tx,
            handles,
        }
    }

    pub async fn shutdown(self) {
        tracing::info!("Stopping background workers");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background worker ended abnormally");
            }
        }
        tracing::info!("Background workers stopped");
    }
}

async fn run_loop(job: Arc<dyn PeriodicJob>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(job.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(
        job = job.name(),
        interval_ms = job.interval().as_millis() as u64,
        "Background job started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = job.run_once().await {
                    tracing::error!(job = job.name(), error = %e, "Background job pass failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(job = job.name(), "Background job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl PeriodicJob for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn run_once(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("failures do not stop the loop")
        }
    }

    #[tokio::test]
    async fn test_job_runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = WorkerHandle::spawn(vec![Arc::new(Counter(runs.clone()))]);
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.shutdown().await;

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
