//! One-time passcodes
//!
//! Codes are keyed by (user, user_type, channel): issuing again overwrites the previous
//! code. A verified code is consumed and exchanged for a short-lived scoped token.

use std::sync::Arc;

use chrono::Duration;
use keystone_core::constants::OTP_LENGTH;
use keystone_core::models::{
    AuditEnvelope, NotificationChannel, NotificationTemplate, OtpType, OutboundNotification,
    Recipient, User, UserType, VerificationChannel, VerificationCode,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{IdentityStore, VerificationStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::auth::{TokenService, TokenType};
use crate::clock::Clock;
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtpAction {
    Send,
    Verify,
    Resend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpRequest {
    pub action: OtpAction,
    pub otp_type: OtpType,
    #[serde(default)]
    pub user_ids: Vec<Uuid>,
    pub email: Option<String>,
    pub user_type: Option<UserType>,
    #[serde(default = "default_channel")]
    pub channel: VerificationChannel,
    pub code: Option<String>,
}

fn default_channel() -> VerificationChannel {
    VerificationChannel::Email
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OtpResponse {
    Sent {
        channel: VerificationChannel,
        expires_in: i64,
    },
    Verified {
        token: String,
        token_type: TokenType,
        expires_in: i64,
    },
}

#[derive(Clone)]
pub struct OtpService {
    identity: Arc<dyn IdentityStore>,
    verification: Arc<dyn VerificationStore>,
    notifier: Notifier,
    tokens: TokenService,
    clock: Arc<dyn Clock>,
}

/// Six random decimal digits.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..OTP_LENGTH)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

fn codes_match(stored: &str, supplied: &str) -> bool {
    stored.as_bytes().ct_eq(supplied.trim().as_bytes()).into()
}

impl OtpService {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        verification: Arc<dyn VerificationStore>,
        notifier: Notifier,
        tokens: TokenService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            verification,
            notifier,
            tokens,
            clock,
        }
    }

    /// Dispatch one `/auth/otp` request.
    pub async fn handle(&self, tenant_id: Uuid, request: &OtpRequest) -> AppResult<OtpResponse> {
        let (user_ids, user_type) = self.resolve_users(tenant_id, request).await?;
        match request.action {
            OtpAction::Send => {
                let user_id = single(&user_ids)?;
                self.issue(tenant_id, user_id, user_type, request.channel, request.otp_type)
                    .await
            }
            OtpAction::Resend => {
                let user_id = single(&user_ids)?;
                self.resend(tenant_id, user_id, user_type, request.channel, request.otp_type)
                    .await
            }
            OtpAction::Verify => {
                let code = request
                    .code
                    .as_deref()
                    .ok_or_else(|| AppError::MissingRequiredParam("code".to_string()))?;
                self.verify(tenant_id, &user_ids, user_type, request.otp_type, code)
                    .await
            }
        }
    }

    async fn resolve_users(
        &self,
        tenant_id: Uuid,
        request: &OtpRequest,
    ) -> AppResult<(Vec<Uuid>, UserType)> {
        if let Some(email) = request.email.as_deref() {
            let user = self
                .identity
                .find_user_by_login(tenant_id, &keystone_core::identity::normalize_email(email))
                .await?
                .ok_or(AppError::UserNotFound)?;
            return Ok((vec![user.id()], user.user_type()));
        }
        if request.user_ids.is_empty() {
            return Err(AppError::MissingRequiredParam("user_ids or email".to_string()));
        }
        let user_type = request
            .user_type
            .ok_or_else(|| AppError::MissingRequiredParam("user_type".to_string()))?;
        Ok((request.user_ids.clone(), user_type))
    }

    /// Store a fresh code for (user, user_type, channel) and queue it for delivery.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub async fn issue(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        channel: VerificationChannel,
        otp_type: OtpType,
    ) -> AppResult<OtpResponse> {
        let user = self
            .identity
            .get_user(tenant_id, user_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        let recipient = recipient_for(&user, channel)?;

        let now = self.clock.now();
        let expiry = self.tokens.settings().otp_expiry_seconds;
        let ctx = RequestContext::system(tenant_id).with_user(user_id);
        let code = VerificationCode {
            audit: AuditEnvelope::stamp_create_at(&ctx, now),
            user_id,
            user_type,
            channel,
            otp_type,
            code: generate_code(),
            expires_on: now + Duration::seconds(expiry),
            last_sent_on: now,
            consumed_on: None,
        };
        let saved = self.verification.upsert_code(&code).await?;

        self.notifier
            .notify(
                &ctx,
                OutboundNotification {
                    channel: match channel {
                        VerificationChannel::Email => NotificationChannel::Email,
                        VerificationChannel::Sms => NotificationChannel::Sms,
                    },
                    recipient,
                    template: NotificationTemplate::OtpCode,
                    context: serde_json::json!({
                        "code": saved.code,
                        "expires_in_minutes": expiry / 60,
                        "otp_type": otp_type,
                    }),
                },
            )
            .await;

        tracing::info!(channel = ?channel, otp_type = ?otp_type, "OTP issued");
        Ok(OtpResponse::Sent {
            channel,
            expires_in: expiry,
        })
    }

    /// Issue again unless the previous code went out less than the resend interval ago.
    pub async fn resend(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        channel: VerificationChannel,
        otp_type: OtpType,
    ) -> AppResult<OtpResponse> {
        let now = self.clock.now();
        let interval = Duration::seconds(self.tokens.settings().otp_resend_interval_seconds);
        if let Some(previous) = self
            .verification
            .get_code(tenant_id, user_id, user_type, channel)
            .await?
        {
            let elapsed = now - previous.last_sent_on;
            if elapsed < interval {
                let retry_after_seconds = (interval - elapsed).num_seconds().max(1);
                tracing::debug!(retry_after_seconds, "OTP resend refused");
                return Err(AppError::OtpResendTooSoon {
                    retry_after_seconds,
                });
            }
        }
        self.issue(tenant_id, user_id, user_type, channel, otp_type)
            .await
    }

    /// Check `code` against the live codes of any of `user_ids`; consume on success.
    #[tracing::instrument(skip(self, code), fields(tenant_id = %tenant_id))]
    pub async fn verify(
        &self,
        tenant_id: Uuid,
        user_ids: &[Uuid],
        user_type: UserType,
        otp_type: OtpType,
        code: &str,
    ) -> AppResult<OtpResponse> {
        let now = self.clock.now();
        let candidates = self
            .verification
            .find_live_codes(tenant_id, user_ids, user_type, now)
            .await?;
        let matched = candidates
            .into_iter()
            .find(|c| c.otp_type == otp_type && c.is_live(now) && codes_match(&c.code, code))
            .ok_or(AppError::InvalidOtp)?;

        if !self
            .verification
            .consume_code(tenant_id, matched.audit.id, now)
            .await?
        {
            return Err(AppError::InvalidOtp);
        }

        let token_type = match otp_type {
            OtpType::ForgotPassword | OtpType::ResetPassword => TokenType::ResetPassword,
            OtpType::RentalApplicationView => TokenType::RentalApplicationView,
        };
        let issued = self.tokens.issue(
            tenant_id,
            matched.user_id,
            user_type,
            token_type,
            Some(matched.audit.id.to_string()),
            now,
        )?;
        tracing::info!(user_id = %matched.user_id, "OTP verified");
        Ok(OtpResponse::Verified {
            token: issued.token,
            token_type,
            expires_in: (issued.expires_at - now).num_seconds(),
        })
    }
}

fn single(user_ids: &[Uuid]) -> AppResult<Uuid> {
    match user_ids {
        [one] => Ok(*one),
        _ => Err(AppError::InvalidInput(
            "exactly one user is required to send a code".to_string(),
        )),
    }
}

fn recipient_for(user: &User, channel: VerificationChannel) -> AppResult<Recipient> {
    let address = match channel {
        VerificationChannel::Email => user.email.clone(),
        VerificationChannel::Sms => user
            .phone
            .as_ref()
            .map(|p| format!("{}{}", user.country_code.as_deref().unwrap_or_default(), p)),
    };
    address
        .map(|address| Recipient::RawAddress { address })
        .ok_or_else(|| {
            AppError::MissingNotificationSetting(format!("no {:?} address on file", channel))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..20 {
            let code = generate_code();
            assert_eq!(code.len(), OTP_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn comparison_trims_input() {
        assert!(codes_match("123456", " 123456 "));
        assert!(!codes_match("123456", "123457"));
        assert!(!codes_match("123456", "12345"));
    }
}
