//! Error types module
//!
//! All business-rule violations surface as an [`AppError`] variant carrying a stable
//! machine-readable code (`user_locked`, `invalid_status`, ...). The HTTP edge maps them
//! to status codes through [`ErrorMetadata`]; services never build HTTP responses.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

use rust_decimal::Decimal;
#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues and security-relevant rejections
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Stable machine-readable error code (e.g. "invalid_otp")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Client-facing English detail (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden from the client
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing required parameter: {0}")]
    MissingRequiredParam(String),

    #[error("Duplicate {0}")]
    Duplicate(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User not found")]
    UserNotFound,

    #[error("User is locked")]
    UserLocked,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired OTP")]
    InvalidOtp,

    #[error("OTP resend requested too soon, retry in {retry_after_seconds}s")]
    OtpResendTooSoon { retry_after_seconds: i64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid status for cancellation: {0}")]
    InvalidStatusForCancellation(String),

    #[error("Invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid CVV")]
    InvalidCvv,

    #[error("Card details missing for card payment")]
    CardMissingPayment,

    #[error("Account details missing for bank payment")]
    AccountMissingPayment,

    #[error("Bill is already paid")]
    PaymentDone,

    #[error("Total refund requested {requested} exceeds refundable amount {refundable}")]
    TotalRefundRequestedTooLarge {
        requested: Decimal,
        refundable: Decimal,
    },

    #[error("Cannot partially refund: {0}")]
    CannotPartiallyRefund(String),

    #[error("Invalid refund method: {0}")]
    InvalidRefundMethod(String),

    #[error("Invalid refund type: {0}")]
    InvalidRefundType(String),

    #[error("Invalid payment ids: {0}")]
    InvalidPaymentIds(String),

    #[error("Missing notification setting: {0}")]
    MissingNotificationSetting(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("No transaction found: {0}")]
    NoTransactionFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        if let SqlxError::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return AppError::Conflict(db_err.message().to_string());
            }
        }
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, sensitive, log_level).
fn app_error_static_metadata(err: &AppError) -> (u16, &'static str, bool, bool, LogLevel) {
    match err {
        AppError::Database(_) => (500, "database_error", true, true, LogLevel::Error),
        AppError::InvalidInput(_) => (400, "invalid_input", false, false, LogLevel::Debug),
        AppError::MissingRequiredParam(_) => {
            (400, "missing_required_param", false, false, LogLevel::Debug)
        }
        AppError::Duplicate(_) => (409, "duplicate", false, false, LogLevel::Debug),
        AppError::Conflict(_) => (409, "conflict", false, false, LogLevel::Debug),
        AppError::NotFound(_) => (404, "not_found", false, false, LogLevel::Debug),
        AppError::UserNotFound => (404, "user_not_found", false, false, LogLevel::Debug),
        AppError::UserLocked => (403, "user_locked", false, false, LogLevel::Warn),
        AppError::InvalidCredentials => (401, "invalid_credentials", false, false, LogLevel::Warn),
        AppError::InvalidOtp => (400, "invalid_otp", false, false, LogLevel::Debug),
        AppError::OtpResendTooSoon { .. } => {
            (400, "otp_resend_too_soon", true, false, LogLevel::Debug)
        }
        AppError::Unauthorized(_) => (401, "unauthorized", false, false, LogLevel::Debug),
        AppError::PermissionDenied(_) => (403, "permission_denied", false, false, LogLevel::Warn),
        AppError::InvalidStatus(_) => (400, "invalid_status", false, false, LogLevel::Debug),
        AppError::InvalidStatusForCancellation(_) => (
            400,
            "invalid_status_for_cancellation",
            false,
            false,
            LogLevel::Debug,
        ),
        AppError::InvalidPaymentMethod(_) => {
            (400, "invalid_payment_method", false, false, LogLevel::Debug)
        }
        AppError::InvalidAmount(_) => (400, "invalid_amount", false, false, LogLevel::Debug),
        AppError::InvalidCvv => (400, "invalid_cvv", false, false, LogLevel::Debug),
        AppError::CardMissingPayment => {
            (400, "card_missing_payment", false, false, LogLevel::Debug)
        }
        AppError::AccountMissingPayment => {
            (400, "account_missing_payment", false, false, LogLevel::Debug)
        }
        AppError::PaymentDone => (400, "payment_done", false, false, LogLevel::Debug),
        AppError::TotalRefundRequestedTooLarge { .. } => (
            400,
            "total_refund_requested_too_large",
            false,
            false,
            LogLevel::Debug,
        ),
        AppError::CannotPartiallyRefund(_) => {
            (400, "cannot_partially_refund", false, false, LogLevel::Debug)
        }
        AppError::InvalidRefundMethod(_) => {
            (400, "invalid_refund_method", false, false, LogLevel::Debug)
        }
        AppError::InvalidRefundType(_) => {
            (400, "invalid_refund_type", false, false, LogLevel::Debug)
        }
        AppError::InvalidPaymentIds(_) => {
            (400, "invalid_payment_ids", false, false, LogLevel::Debug)
        }
        AppError::MissingNotificationSetting(_) => (
            400,
            "missing_notification_setting",
            false,
            false,
            LogLevel::Warn,
        ),
        AppError::Gateway(_) => (500, "gateway_error", true, true, LogLevel::Error),
        AppError::NoTransactionFound(_) => {
            (404, "no_transaction_found", false, false, LogLevel::Debug)
        }
        AppError::Internal(_) | AppError::InternalWithSource { .. } => {
            (500, "unknown_error", true, true, LogLevel::Error)
        }
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::MissingRequiredParam(_) => "MissingRequiredParam",
            AppError::Duplicate(_) => "Duplicate",
            AppError::Conflict(_) => "Conflict",
            AppError::NotFound(_) => "NotFound",
            AppError::UserNotFound => "UserNotFound",
            AppError::UserLocked => "UserLocked",
            AppError::InvalidCredentials => "InvalidCredentials",
            AppError::InvalidOtp => "InvalidOtp",
            AppError::OtpResendTooSoon { .. } => "OtpResendTooSoon",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::PermissionDenied(_) => "PermissionDenied",
            AppError::InvalidStatus(_) => "InvalidStatus",
            AppError::InvalidStatusForCancellation(_) => "InvalidStatusForCancellation",
            AppError::InvalidPaymentMethod(_) => "InvalidPaymentMethod",
            AppError::InvalidAmount(_) => "InvalidAmount",
            AppError::InvalidCvv => "InvalidCvv",
            AppError::CardMissingPayment => "CardMissingPayment",
            AppError::AccountMissingPayment => "AccountMissingPayment",
            AppError::PaymentDone => "PaymentDone",
            AppError::TotalRefundRequestedTooLarge { .. } => "TotalRefundRequestedTooLarge",
            AppError::CannotPartiallyRefund(_) => "CannotPartiallyRefund",
            AppError::InvalidRefundMethod(_) => "InvalidRefundMethod",
            AppError::InvalidRefundType(_) => "InvalidRefundType",
            AppError::InvalidPaymentIds(_) => "InvalidPaymentIds",
            AppError::MissingNotificationSetting(_) => "MissingNotificationSetting",
            AppError::Gateway(_) => "Gateway",
            AppError::NoTransactionFound(_) => "NoTransactionFound",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }

    /// True for serialization failures, deadlocks and lock timeouts; the caller may retry
    /// the whole transaction once.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            AppError::Database(SqlxError::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                Some("40001") | Some("40P01") | Some("55P03")
            ),
            _ => false,
        }
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).3
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).4
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::InvalidInput(msg) => msg.clone(),
            AppError::MissingRequiredParam(param) => {
                format!("Missing required parameter: {}", param)
            }
            AppError::Duplicate(what) => format!("A {} with the same key already exists", what),
            AppError::Conflict(_) => "The resource conflicts with an existing record".to_string(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::UserNotFound => "User not found".to_string(),
            AppError::UserLocked => {
                "Your account is locked due to repeated failed login attempts. Try again later."
                    .to_string()
            }
            AppError::InvalidCredentials => "Invalid username or password".to_string(),
            AppError::InvalidOtp => "The code is invalid or has expired".to_string(),
            AppError::OtpResendTooSoon {
                retry_after_seconds,
            } => format!(
                "Please wait {} seconds before requesting a new code",
                retry_after_seconds
            ),
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::PermissionDenied(_) => {
                "You do not have permission to perform this action".to_string()
            }
            AppError::InvalidStatus(msg) => msg.clone(),
            AppError::InvalidStatusForCancellation(msg) => msg.clone(),
            AppError::InvalidPaymentMethod(method) => {
                format!("Payment method {} is not allowed here", method)
            }
            AppError::InvalidAmount(msg) => msg.clone(),
            AppError::InvalidCvv => "CVV must be 3 or 4 digits".to_string(),
            AppError::CardMissingPayment => {
                "Card details or a saved card are required for card payments".to_string()
            }
            AppError::AccountMissingPayment => {
                "Account details or a saved account are required for bank payments".to_string()
            }
            AppError::PaymentDone => "This bill has already been paid".to_string(),
            AppError::TotalRefundRequestedTooLarge {
                requested,
                refundable,
            } => format!(
                "Total refund requested ({}) exceeds the refundable amount ({})",
                requested, refundable
            ),
            AppError::CannotPartiallyRefund(msg) => msg.clone(),
            AppError::InvalidRefundMethod(method) => {
                format!("Refund method {} is not supported", method)
            }
            AppError::InvalidRefundType(msg) => msg.clone(),
            AppError::InvalidPaymentIds(msg) => msg.clone(),
            AppError::MissingNotificationSetting(msg) => msg.clone(),
            AppError::Gateway(_) => "Payment gateway error".to_string(),
            AppError::NoTransactionFound(msg) => msg.clone(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal server error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_metadata_database() {
        #[cfg(feature = "sqlx")]
        let err = AppError::from(sqlx::Error::PoolClosed);
        #[cfg(not(feature = "sqlx"))]
        let err = AppError::Database("pool closed".to_string());
        assert_eq!(err.http_status_code(), 500);
        assert_eq!(err.error_code(), "database_error");
        assert!(err.is_recoverable());
        assert_eq!(err.client_message(), "Failed to access database");
        assert!(err.is_sensitive());
        assert_eq!(err.log_level(), LogLevel::Error);
    }

    #[test]
    fn test_login_errors_have_stable_codes() {
        assert_eq!(AppError::UserLocked.error_code(), "user_locked");
        assert_eq!(AppError::UserLocked.http_status_code(), 403);
        assert_eq!(AppError::InvalidCredentials.error_code(), "invalid_credentials");
        assert_eq!(AppError::InvalidCredentials.http_status_code(), 401);
        assert_eq!(AppError::UserNotFound.http_status_code(), 404);
    }

    #[test]
    fn test_refund_too_large_message_contains_amounts() {
        let err = AppError::TotalRefundRequestedTooLarge {
            requested: dec!(150.00),
            refundable: dec!(100.00),
        };
        assert_eq!(err.http_status_code(), 400);
        assert_eq!(err.error_code(), "total_refund_requested_too_large");
        assert!(err.client_message().contains("150.00"));
        assert!(err.client_message().contains("100.00"));
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let err = AppError::Internal("stack details".to_string());
        assert_eq!(err.error_code(), "unknown_error");
        assert_eq!(err.client_message(), "Internal server error");
        assert!(err.is_sensitive());
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let err = AppError::Conflict("payments_transaction_id_key".to_string());
        assert_eq!(err.http_status_code(), 409);
        assert!(!err.client_message().contains("payments_transaction_id_key"));
    }
}
