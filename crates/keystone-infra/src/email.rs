//! SMTP delivery for email notifications.

use std::sync::Arc;

use async_trait::async_trait;
use keystone_core::models::NotificationChannel;
use keystone_core::{AppError, AppResult, Config};
use keystone_services::{NotificationTransport, RenderedMessage};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

#[derive(Clone)]
pub struct SmtpTransport {
    mailer: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpTransport {
    /// Builds the transport from `SMTP_*` settings. `None` when SMTP is not configured;
    /// callers then fall back to logging.
    pub fn from_config(config: &Config) -> Option<Self> {
        let host = config.smtp_host()?;
        let from: Mailbox = match config.smtp_from()?.parse() {
            Ok(from) => from,
            Err(e) => {
                tracing::warn!(error = %e, "SMTP_FROM is not a valid mailbox; email disabled");
                return None;
            }
        };
        let port = config.smtp_port().unwrap_or(587);
        let credentials = match (config.smtp_user(), config.smtp_password()) {
            (Some(user), Some(password)) => {
                Some(Credentials::new(user.to_string(), password.to_string()))
            }
            _ => None,
        };

        let builder = if config.smtp_tls() {
            match AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host) {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::warn!(error = %e, host = %host, "Invalid SMTP relay; email disabled");
                    return None;
                }
            }
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let builder = builder.port(port);
        let builder = match credentials {
            Some(credentials) => builder.credentials(credentials),
            None => builder,
        };

        tracing::info!(host = %host, port, tls = config.smtp_tls(), "SMTP transport initialized");
        Some(Self {
            mailer: Arc::new(builder.build()),
            from,
        })
    }

    fn build_message(&self, message: &RenderedMessage) -> AppResult<Message> {
        let to: Mailbox = message.address.parse().map_err(|e| {
            AppError::InvalidInput(format!("Invalid recipient address: {}", e))
        })?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl NotificationTransport for SmtpTransport {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    async fn send(&self, message: &RenderedMessage) -> AppResult<()> {
        let email = self.build_message(message)?;
        self.mailer
            .send(email)
            .await
            .map_err(|e| AppError::Internal(format!("SMTP send failed: {}", e)))?;
        tracing::info!(notification_id = %message.notification_id, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn transport() -> SmtpTransport {
        SmtpTransport {
            mailer: Arc::new(
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("localhost").build(),
            ),
            from: "Keystone <no-reply@keystone.test>".parse().unwrap(),
        }
    }

    fn message(address: &str) -> RenderedMessage {
        RenderedMessage {
            notification_id: Uuid::new_v4(),
            address: address.to_string(),
            subject: "Payment received".to_string(),
            body: "We received 100.00 USD.".to_string(),
        }
    }

    #[test]
    fn test_message_is_addressed_to_recipient() {
        let email = transport()
            .build_message(&message("resident@harborview.test"))
            .unwrap();
        let formatted = String::from_utf8(email.formatted()).unwrap();
        assert!(formatted.contains("To: resident@harborview.test"));
        assert!(formatted.contains("Subject: Payment received"));
    }

    #[test]
    fn test_bad_recipient_is_invalid_input() {
        let result = transport().build_message(&message("not an address"));
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
