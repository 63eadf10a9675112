//! Notification producer
//!
//! Business operations hand outbound messages to the [`Notifier`] after their transaction
//! commits. Rows land in the queue as QUEUED and the worker delivers them through a
//! [`NotificationTransport`] per channel.

use std::sync::Arc;

use async_trait::async_trait;
use keystone_core::models::{
    AuditEnvelope, Notification, NotificationChannel, NotificationStatus, NotificationTemplate,
    OutboundNotification, Recipient,
};
use keystone_core::{AppResult, RequestContext};
use keystone_db::NotificationStore;

use crate::clock::Clock;

/// A notification resolved to an address and rendered for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub notification_id: uuid::Uuid,
    pub address: String,
    pub subject: String,
    pub body: String,
}

impl RenderedMessage {
    pub fn render(notification: &Notification, address: String) -> Self {
        Self {
            notification_id: notification.audit.id,
            address,
            subject: notification.template.subject().to_string(),
            body: notification.template.body(&notification.context),
        }
    }
}

/// Outbound channel (SMTP, SMS provider, push service).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(&self, message: &RenderedMessage) -> AppResult<()>;
}

/// Writes messages to the log instead of sending them. Used when a channel has no
/// configured provider.
pub struct LogTransport {
    channel: NotificationChannel,
}

impl LogTransport {
    pub fn new(channel: NotificationChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationTransport for LogTransport {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, message: &RenderedMessage) -> AppResult<()> {
        tracing::info!(
            notification_id = %message.notification_id,
            channel = ?self.channel,
            subject = %message.subject,
            "Notification delivered to log"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn enqueue(
        &self,
        ctx: &RequestContext,
        outbound: OutboundNotification,
    ) -> AppResult<Notification> {
        let now = self.clock.now();
        let notification = Notification {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            channel: outbound.channel,
            recipient_kind: outbound.recipient.kind(),
            recipient: serde_json::to_value(&outbound.recipient)?,
            template: outbound.template,
            context: outbound.context,
            status: NotificationStatus::Queued,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            sent_on: None,
        };
        self.store.enqueue(&notification).await?;
        tracing::debug!(
            notification_id = %notification.audit.id,
            template = ?notification.template,
            channel = ?notification.channel,
            "Notification queued"
        );
        Ok(notification)
    }

    /// Enqueue without failing the caller; the triggering change is already committed.
    pub async fn notify(&self, ctx: &RequestContext, outbound: OutboundNotification) {
        let template = outbound.template;
        if let Err(e) = self.enqueue(ctx, outbound).await {
            tracing::warn!(
                error = %e,
                tenant_id = %ctx.tenant_id,
                template = ?template,
                "Failed to queue notification"
            );
        }
    }

    /// Email a resident about one of their records.
    pub async fn notify_resident(
        &self,
        ctx: &RequestContext,
        resident_id: uuid::Uuid,
        template: NotificationTemplate,
        context: serde_json::Value,
    ) {
        self.notify(
            ctx,
            OutboundNotification {
                channel: NotificationChannel::Email,
                recipient: Recipient::ResidentRef { resident_id },
                template,
                context,
            },
        )
        .await;
    }
}
