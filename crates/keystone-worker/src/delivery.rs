//! Notification delivery
//!
//! Each pass leases a batch of due QUEUED rows, resolves the recipient to an address,
//! renders the template and hands the message to the transport registered for the
//! row's channel. Sends run concurrently up to `max_concurrent`.
//!
//! A recoverable failure reschedules the row `2^attempts` seconds out (capped); once
//! `max_retries` attempts are used up, or the failure is not recoverable (no address on
//! file, no transport for the channel), the row becomes FAILED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use keystone_core::models::{Notification, NotificationChannel, Recipient};
use keystone_core::{AppError, AppResult, ErrorMetadata};
use keystone_db::{IdentityStore, NotificationStore};
use keystone_services::{Clock, NotificationTransport, RenderedMessage};
use tokio::sync::Semaphore;

use crate::periodic::PeriodicJob;

/// Upper bound on the delay between two delivery attempts.
pub const MAX_NOTIFICATION_BACKOFF_SECONDS: i64 = 300;

/// Delay before the next attempt once `attempts` sends have failed.
pub(crate) fn compute_backoff_seconds(attempts: i32) -> i64 {
    2_i64
        .saturating_pow(attempts.clamp(0, 30) as u32)
        .min(MAX_NOTIFICATION_BACKOFF_SECONDS)
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_retries: i32,
    /// How long a claimed row stays invisible to other workers.
    pub lease_seconds: i64,
    pub max_concurrent: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            max_retries: 3,
            lease_seconds: 60,
            max_concurrent: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

enum Outcome {
    Sent,
    Retried,
    Failed,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    identity: Arc<dyn IdentityStore>,
    transports: Arc<HashMap<NotificationChannel, Arc<dyn NotificationTransport>>>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        identity: Arc<dyn IdentityStore>,
        transports: Vec<Arc<dyn NotificationTransport>>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        let transports = transports
            .into_iter()
            .map(|t| (t.channel(), t))
            .collect::<HashMap<_, _>>();
        Self {
            store,
            identity,
            transports: Arc::new(transports),
            clock,
            config,
        }
    }

    /// Claims and processes one batch.
    pub async fn deliver_due(&self) -> Result<DeliveryReport> {
        let now = self.clock.now();
        let lease_until = now + ChronoDuration::seconds(self.config.lease_seconds);
        let due = self
            .store
            .claim_due(now, lease_until, self.config.batch_size)
            .await
            .context("Failed to claim due notifications")?;

        let mut report = DeliveryReport {
            claimed: due.len(),
            ..DeliveryReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        tracing::debug!(count = due.len(), "Delivering notifications");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(due.len());
        for notification in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Delivery semaphore closed")?;
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                let outcome = dispatcher.deliver_one(&notification).await;
                drop(permit);
                outcome
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(Outcome::Sent)) => report.sent += 1,
                Ok(Ok(Outcome::Retried)) => report.retried += 1,
                Ok(Ok(Outcome::Failed)) => report.failed += 1,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Failed to record notification outcome");
                }
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        if report.retried > 0 || report.failed > 0 {
            tracing::info!(
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                "Notification batch finished with errors"
            );
        }
        Ok(report)
    }

    #[tracing::instrument(skip(self, notification), fields(notification_id = %notification.audit.id, channel = ?notification.channel))]
    async fn deliver_one(&self, notification: &Notification) -> AppResult<Outcome> {
        let id = notification.audit.id;
        let attempts = notification.attempts + 1;

        let error = match self.send(notification).await {
            Ok(()) => {
                self.store.mark_sent(id, self.clock.now()).await?;
                return Ok(Outcome::Sent);
            }
            Err(e) => e,
        };

        let message = error.to_string();
        if !error.is_recoverable() || attempts >= self.config.max_retries {
            tracing::warn!(
                attempts,
                recoverable = error.is_recoverable(),
                error = %message,
                "Notification delivery failed permanently"
            );
            self.store.mark_failed(id, attempts, &message).await?;
            return Ok(Outcome::Failed);
        }

        let backoff = compute_backoff_seconds(attempts);
        tracing::info!(attempts, backoff_seconds = backoff, error = %message, "Notification delivery will be retried");
        let next_attempt_at = self.clock.now() + ChronoDuration::seconds(backoff);
        self.store
            .mark_retry(id, attempts, next_attempt_at, &message)
            .await?;
        Ok(Outcome::Retried)
    }

    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let transport = self.transports.get(&notification.channel).ok_or_else(|| {
            AppError::MissingNotificationSetting(format!(
                "No transport configured for {:?}",
                notification.channel
            ))
        })?;
        let address = self.resolve_address(notification).await?;
        transport
            .send(&RenderedMessage::render(notification, address))
            .await
    }

    async fn resolve_address(&self, notification: &Notification) -> AppResult<String> {
        let recipient = notification.recipient()?;
        let profile_id = match recipient {
            Recipient::RawAddress { address } => return Ok(address),
            Recipient::StaffRef { staff_id } => staff_id,
            Recipient::ResidentRef { resident_id } => resident_id,
        };
        if notification.channel != NotificationChannel::Email {
            return Err(AppError::MissingNotificationSetting(format!(
                "{:?} delivery needs an explicit address",
                notification.channel
            )));
        }
        self.identity
            .profile_email(
                notification.audit.tenant_id,
                notification.recipient_kind,
                profile_id,
            )
            .await?
            .ok_or_else(|| {
                AppError::MissingNotificationSetting(format!(
                    "No email on file for {:?} {}",
                    notification.recipient_kind, profile_id
                ))
            })
    }
}

#[async_trait]
impl PeriodicJob for NotificationDispatcher {
    fn name(&self) -> &'static str {
        "notification_delivery"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    async fn run_once(&self) -> Result<()> {
        self.deliver_due().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exponential_then_capped() {
        assert_eq!(compute_backoff_seconds(1), 2);
        assert_eq!(compute_backoff_seconds(2), 4);
        assert_eq!(compute_backoff_seconds(8), 256);
        assert_eq!(compute_backoff_seconds(9), MAX_NOTIFICATION_BACKOFF_SECONDS);
        assert_eq!(compute_backoff_seconds(40), MAX_NOTIFICATION_BACKOFF_SECONDS);
    }
}
