use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuditEnvelope, PaymentMethod};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "refund_type", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundType {
    FullRefund,
    PartialRefund,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "refund_request_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundRequestStatus {
    Pending,
    InProgress,
    Failed,
    PartialSuccess,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BillRefundRequest {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub display_id: String,
    pub bill_id: Uuid,
    pub refund_type: RefundType,
    pub total_refund_requested: Decimal,
    pub total_refund_processed: Decimal,
    pub currency: String,
    pub refund_reason: Option<String>,
    pub status: RefundRequestStatus,
    /// Handle of the process executing the refunds.
    pub process_handle: Option<Uuid>,
}

impl BillRefundRequest {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }
}

/// One requested refund line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundTransactionInput {
    pub parent: Option<Uuid>,
    pub payment_method: PaymentMethod,
    pub amount: Decimal,
}

/// `POST /bill-refund-requests` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequestInput {
    pub bill: Uuid,
    pub refund_type: Option<RefundType>,
    pub refund_reason: Option<String>,
    pub refund_transactions: Vec<RefundTransactionInput>,
}
