//! Payment gateway adapter
//!
//! [`PaymentGateway`] is the seam every backing processor implements. Calls return the raw
//! request and response bodies next to the parsed outcome; the payment services redact and
//! log them as transaction log rows. A transport failure surfaces as
//! [`AppError::Gateway`](keystone_core::AppError::Gateway) and leaves the caller's payment
//! PENDING for the reconciler.

mod http;
mod mock;

pub use http::HttpGateway;
pub use mock::MockGateway;

use async_trait::async_trait;
use chrono::NaiveDate;
use keystone_core::models::{AccountDetails, CardDetails, GatewayStatus, Payment, PaymentMethod};
use keystone_core::payments::RefundMethodology;
use keystone_core::AppResult;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One request/response pair as exchanged with the processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayExchange {
    pub request: serde_json::Value,
    pub response: serde_json::Value,
}

/// Outcome of a sale, consent, charge or void call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub success: bool,
    /// Transaction id, or the consent id for consent calls.
    pub transaction_id: Option<String>,
    pub status: Option<GatewayStatus>,
    /// Passed through to the client untouched.
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub exchange: GatewayExchange,
}

/// A transaction as the processor reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub transaction_id: String,
    pub order_id: Option<String>,
    pub status: GatewayStatus,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub transaction: Option<GatewayTransaction>,
    pub error: Option<String>,
    pub exchange: GatewayExchange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub success: bool,
    pub methodology: Option<RefundMethodology>,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    pub exchange: GatewayExchange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub success: bool,
    /// Processor-side id of this reconcile run.
    pub request_id: Option<String>,
    pub transactions: Vec<GatewayTransaction>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub exchange: GatewayExchange,
}

/// Terms of a recurring-charge consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentTerms {
    pub full_amount: Decimal,
    pub emi_amount: Decimal,
    pub consent_days: i32,
    pub start_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileQuery {
    Settled,
    All,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authenticate(&self) -> AppResult<String>;

    async fn sale_card(
        &self,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse>;

    async fn sale_account(
        &self,
        order_id: &str,
        amount: Decimal,
        account: &AccountDetails,
    ) -> AppResult<GatewayResponse>;

    async fn sale_card_recur(
        &self,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
        payment_term: i32,
        installment_date: NaiveDate,
    ) -> AppResult<GatewayResponse>;

    async fn create_consent_card(
        &self,
        terms: &ConsentTerms,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse>;

    async fn create_consent_account(&self, account: &AccountDetails) -> AppResult<GatewayResponse>;

    async fn charge_consent_card(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse>;

    async fn charge_consent_account(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse>;

    /// Look a transaction up by id, or by our payment id when the sale never answered.
    async fn query_transaction(
        &self,
        transaction_id: Option<&str>,
        method: PaymentMethod,
        payment_id: Uuid,
    ) -> AppResult<QueryResponse>;

    /// Void a transaction that is still OPEN.
    async fn cancel_transaction(
        &self,
        transaction_id: &str,
        method: PaymentMethod,
    ) -> AppResult<GatewayResponse>;

    /// Return `amount` from a transaction: voided while OPEN, credited once SETTLED.
    async fn refund_transaction(
        &self,
        parent_id: Uuid,
        transaction_id: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> AppResult<RefundResponse>;

    async fn reconcile(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        query: ReconcileQuery,
    ) -> AppResult<ReconcileResponse>;

    /// Opaque fields for a client-side POS widget.
    async fn prepare_request_for_pos_payment(
        &self,
        payment: &Payment,
        amount: Decimal,
    ) -> AppResult<serde_json::Value>;
}

/// CVVs are three or four digits.
pub fn valid_cvv(cvv: &str) -> bool {
    (3..=4).contains(&cvv.len()) && cvv.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cvv_shape() {
        assert!(valid_cvv("123"));
        assert!(valid_cvv("1234"));
        assert!(!valid_cvv("12"));
        assert!(!valid_cvv("12a"));
        assert!(!valid_cvv("12345"));
    }
}
