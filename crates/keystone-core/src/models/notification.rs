use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "notification_channel", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "notification_status", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "notification_template", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    OtpCode,
    BookingConfirmed,
    BookingRejected,
    BookingCancelled,
    RefundInitiated,
    PaymentReceipt,
    InstallmentFailed,
}

impl NotificationTemplate {
    pub fn subject(&self) -> &'static str {
        match self {
            NotificationTemplate::OtpCode => "Your verification code",
            NotificationTemplate::BookingConfirmed => "Your booking is confirmed",
            NotificationTemplate::BookingRejected => "Your booking was declined",
            NotificationTemplate::BookingCancelled => "Your booking was cancelled",
            NotificationTemplate::RefundInitiated => "Your refund is on its way",
            NotificationTemplate::PaymentReceipt => "Payment received",
            NotificationTemplate::InstallmentFailed => "Installment payment failed",
        }
    }

    /// Plain-text body filled from the context captured at enqueue time.
    pub fn body(&self, context: &serde_json::Value) -> String {
        let field = |key: &str| match context.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => "-".to_string(),
            Some(other) => other.to_string(),
        };
        match self {
            NotificationTemplate::OtpCode => format!(
                "Your verification code is {}. It expires in {} minutes.",
                field("code"),
                field("expires_in_minutes")
            ),
            NotificationTemplate::BookingConfirmed => format!(
                "Your booking on {} from {} to {} is confirmed.",
                field("booking_date"),
                field("start_time"),
                field("end_time")
            ),
            NotificationTemplate::BookingRejected => format!(
                "Your booking on {} from {} to {} was declined. Reason: {}.",
                field("booking_date"),
                field("start_time"),
                field("end_time"),
                field("reason")
            ),
            NotificationTemplate::BookingCancelled => format!(
                "Your booking on {} from {} to {} was cancelled. Reason: {}.",
                field("booking_date"),
                field("start_time"),
                field("end_time"),
                field("reason")
            ),
            NotificationTemplate::RefundInitiated => format!(
                "Refund {} of {} {} for bill {} has been initiated.",
                field("refund_display_id"),
                field("amount"),
                field("currency"),
                field("display_id")
            ),
            NotificationTemplate::PaymentReceipt => format!(
                "We received {} {} for bill {}. Remaining balance: {}.",
                field("amount"),
                field("currency"),
                field("display_id"),
                field("balance_due")
            ),
            NotificationTemplate::InstallmentFailed => format!(
                "Installment {} of {} for bill {} due {} could not be charged: {}.",
                field("installment"),
                field("amount"),
                field("display_id"),
                field("due_date"),
                field("reason")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "recipient_kind", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Staff,
    Resident,
    Raw,
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    StaffRef { staff_id: Uuid },
    ResidentRef { resident_id: Uuid },
    RawAddress { address: String },
}

impl Recipient {
    pub fn kind(&self) -> RecipientKind {
        match self {
            Recipient::StaffRef { .. } => RecipientKind::Staff,
            Recipient::ResidentRef { .. } => RecipientKind::Resident,
            Recipient::RawAddress { .. } => RecipientKind::Raw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Notification {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub channel: NotificationChannel,
    pub recipient_kind: RecipientKind,
    pub recipient: serde_json::Value,
    pub template: NotificationTemplate,
    pub context: serde_json::Value,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub sent_on: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn recipient(&self) -> Result<Recipient, crate::AppError> {
        serde_json::from_value(self.recipient.clone()).map_err(crate::AppError::from)
    }
}

/// A message to enqueue once the producing transaction has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundNotification {
    pub channel: NotificationChannel,
    pub recipient: Recipient,
    pub template: NotificationTemplate,
    pub context: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_otp_body_includes_code() {
        let body = NotificationTemplate::OtpCode.body(&json!({
            "code": "482913",
            "expires_in_minutes": 5,
        }));
        assert_eq!(
            body,
            "Your verification code is 482913. It expires in 5 minutes."
        );
    }

    #[test]
    fn test_missing_fields_render_as_dash() {
        let body = NotificationTemplate::BookingRejected.body(&json!({
            "booking_date": "2025-01-06",
            "start_time": "10:00:00",
            "end_time": "11:00:00",
            "reason": null,
        }));
        assert!(body.ends_with("Reason: -."));
    }
}
