use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "payment_method", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    BankTransfer,
    PosPayment,
    Cash,
    BackToSource,
    Wallet,
    WriteOff,
    Adjustment,
    Paypal,
    GooglePay,
}

impl PaymentMethod {
    pub fn is_card(&self) -> bool {
        matches!(self, PaymentMethod::CreditCard | PaymentMethod::DebitCard)
    }

    /// Methods that go through the payment gateway.
    pub fn uses_gateway(&self) -> bool {
        matches!(
            self,
            PaymentMethod::CreditCard
                | PaymentMethod::DebitCard
                | PaymentMethod::BankTransfer
                | PaymentMethod::PosPayment
        )
    }

    /// Methods a refund transaction may use.
    pub fn is_refund_method(&self) -> bool {
        matches!(
            self,
            PaymentMethod::BackToSource
                | PaymentMethod::Cash
                | PaymentMethod::Wallet
                | PaymentMethod::WriteOff
                | PaymentMethod::Adjustment
        )
    }

    /// Refund methods that must name the payment they return money from.
    pub fn requires_parent(&self) -> bool {
        matches!(self, PaymentMethod::BackToSource | PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    InProcess,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::InProcess)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "gateway_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Open,
    Settled,
    Failed,
    Voided,
    CreditApplied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "payment_plan_kind", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentPlanKind {
    Full,
    Monthly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "transaction_type", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Payment,
    Refund,
    /// Offsetting ledger line for a refund returned outside the gateway.
    Credit,
}

/// A payment or refund transaction. Refunds point at the payment they return money from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Payment {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub bill_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub refund_request_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub order_id: String,
    pub amount: Decimal,
    pub refund_amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub gateway_status: Option<GatewayStatus>,
    pub transaction_id: Option<String>,
    pub extra_data: serde_json::Value,
    pub installment_date: Option<NaiveDate>,
    pub payment_term: Option<i32>,
    pub payment_plan: PaymentPlanKind,
    pub processed_on: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }

    /// What can still be returned from this payment.
    pub fn refundable_amount(&self) -> Decimal {
        match self.status {
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded => {
                (self.amount - self.refund_amount).max(Decimal::ZERO)
            }
            _ => Decimal::ZERO,
        }
    }
}

/// Card data as supplied by the client. Never persisted in clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDetails {
    pub number: String,
    pub expiry_month: i16,
    pub expiry_year: i16,
    pub holder_name: Option<String>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDetails {
    pub account_number: String,
    pub routing_number: String,
    pub account_type: String,
    pub holder_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SavedCard {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub resident_id: Uuid,
    #[serde(skip_serializing)]
    pub card_encrypted: String,
    pub last_four: String,
    pub brand: Option<String>,
    pub expiry_month: i16,
    pub expiry_year: i16,
    pub holder_name: Option<String>,
    pub primary_method: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SavedAccount {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub resident_id: Uuid,
    #[serde(skip_serializing)]
    pub account_encrypted: String,
    #[serde(skip_serializing)]
    pub routing_encrypted: String,
    pub last_four: String,
    pub account_type: String,
    pub holder_name: Option<String>,
    pub primary_method: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "gateway_event", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEvent {
    AuthGateway,
    SaleGateway,
    ConsentGateway,
    QueryGateway,
    VoidGateway,
    CreditGateway,
    ReconcileGateway,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "event_source", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSource {
    System,
    Gateway,
}

/// Redacted record of one gateway exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TransactionLog {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub payment_id: Option<Uuid>,
    pub event: GatewayEvent,
    pub event_source: EventSource,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub success: bool,
}

/// Per-tenant reconciler checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct GatewayReconState {
    pub tenant_id: Uuid,
    pub gateway_recon_last_request_id: Option<String>,
    pub last_run_on: Option<DateTime<Utc>>,
}

/// `POST /bills/{id}/pay` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayRequest {
    pub amount: Option<Decimal>,
    pub payment_method: PaymentMethod,
    pub payment_plan_id: Option<Uuid>,
    pub installment_date: Option<NaiveDate>,
    pub saved_card: Option<Uuid>,
    pub card: Option<CardDetails>,
    pub saved_account: Option<Uuid>,
    pub account: Option<AccountDetails>,
    pub cvv: Option<String>,
    #[serde(default)]
    pub save_method: bool,
    #[serde(default)]
    pub make_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayResponse {
    pub payment_id: Option<Uuid>,
    pub status: PaymentStatus,
    pub extra_data: serde_json::Value,
}
