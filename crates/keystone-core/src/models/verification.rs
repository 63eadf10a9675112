use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuditEnvelope, UserType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "verification_channel", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum VerificationChannel {
    Email,
    Sms,
}

/// Purpose an OTP (or a scoped token) was issued for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "otp_type", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OtpType {
    ForgotPassword,
    ResetPassword,
    RentalApplicationView,
}

/// One live code per (user, user_type, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct VerificationCode {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub user_type: UserType,
    pub channel: VerificationChannel,
    pub otp_type: OtpType,
    #[serde(skip_serializing)]
    pub code: String,
    pub expires_on: DateTime<Utc>,
    pub last_sent_on: DateTime<Utc>,
    pub consumed_on: Option<DateTime<Utc>>,
}

impl VerificationCode {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.consumed_on.is_none() && !self.audit.is_deleted() && now < self.expires_on
    }
}
