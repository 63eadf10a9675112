use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use keystone_core::encryption::redact_json;
use keystone_core::models::{AccountDetails, CardDetails, GatewayStatus, Payment, PaymentMethod};
use keystone_core::payments::RefundMethodology;
use keystone_core::{AppError, AppResult};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    valid_cvv, ConsentTerms, GatewayExchange, GatewayResponse, GatewayTransaction,
    PaymentGateway, QueryResponse, ReconcileQuery, ReconcileResponse, RefundResponse,
};

/// Card numbers ending in this suffix are declined.
pub const DECLINED_CARD_SUFFIX: &str = "0002";

#[derive(Debug, Clone)]
struct MockTransaction {
    order_id: Option<String>,
    status: GatewayStatus,
    amount: Decimal,
    credited: Decimal,
}

/// In-process processor with deterministic outcomes, for tests and local sandboxes.
///
/// Sales open a transaction, [`MockGateway::settle`] moves it to SETTLED, and
/// [`MockGateway::set_offline`] makes every call fail as if the network timed out.
/// [`MockGateway::set_lose_responses`] keeps opening transactions but fails the call, as
/// when the processor took the charge and the answer never arrived.
#[derive(Debug, Default)]
pub struct MockGateway {
    transactions: Mutex<HashMap<String, MockTransaction>>,
    consents: Mutex<HashMap<String, Decimal>>,
    sequence: AtomicU64,
    offline: AtomicBool,
    lose_responses: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_lose_responses(&self, lose: bool) {
        self.lose_responses.store(lose, Ordering::SeqCst);
    }

    /// Mark an OPEN transaction SETTLED.
    pub fn settle(&self, transaction_id: &str) -> AppResult<()> {
        let mut txs = self.lock_transactions()?;
        let tx = txs
            .get_mut(transaction_id)
            .ok_or_else(|| AppError::NoTransactionFound(transaction_id.to_string()))?;
        if tx.status == GatewayStatus::Open {
            tx.status = GatewayStatus::Settled;
        }
        Ok(())
    }

    pub fn status_of(&self, transaction_id: &str) -> Option<GatewayStatus> {
        self.lock_transactions()
            .ok()
            .and_then(|txs| txs.get(transaction_id).map(|t| t.status))
    }

    fn lock_transactions(
        &self,
    ) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, MockTransaction>>> {
        self.transactions
            .lock()
            .map_err(|_| AppError::Internal("mock gateway state poisoned".to_string()))
    }

    fn ensure_online(&self, call: &str) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Gateway(format!("{} timed out", call)));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{:06}", prefix, self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn exchange(request: Value, response: &Value) -> GatewayExchange {
        GatewayExchange {
            request,
            response: response.clone(),
        }
    }

    fn declined(request: Value, reason: &str) -> GatewayResponse {
        let response = json!({ "status": "FAILED", "message": reason });
        GatewayResponse {
            success: false,
            transaction_id: None,
            status: Some(GatewayStatus::Failed),
            data: Value::Null,
            error: Some(reason.to_string()),
            exchange: Self::exchange(request, &response),
        }
    }

    fn open_transaction(
        &self,
        request: Value,
        order_id: Option<&str>,
        amount: Decimal,
    ) -> AppResult<GatewayResponse> {
        if amount <= Decimal::ZERO {
            return Ok(Self::declined(request, "amount must be positive"));
        }
        let transaction_id = self.next_id("mock-txn");
        self.lock_transactions()?.insert(
            transaction_id.clone(),
            MockTransaction {
                order_id: order_id.map(str::to_string),
                status: GatewayStatus::Open,
                amount,
                credited: Decimal::ZERO,
            },
        );
        if self.lose_responses.load(Ordering::SeqCst) {
            return Err(AppError::Gateway("response lost".to_string()));
        }
        let response = json!({ "transaction_id": transaction_id, "status": "OPEN", "amount": amount });
        Ok(GatewayResponse {
            success: true,
            transaction_id: Some(transaction_id),
            status: Some(GatewayStatus::Open),
            data: json!({ "authorization_code": "MOCK-OK" }),
            error: None,
            exchange: Self::exchange(request, &response),
        })
    }

    fn card_sale(
        &self,
        request: Value,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse> {
        if !valid_cvv(cvv) {
            return Ok(Self::declined(request, "cvv rejected"));
        }
        if card.number.ends_with(DECLINED_CARD_SUFFIX) {
            return Ok(Self::declined(request, "card declined"));
        }
        self.open_transaction(request, Some(order_id), amount)
    }
}

fn card_request(card: &CardDetails, cvv: &str, extra: Value) -> Value {
    redact_json(&json!({
        "card": { "card_number": card.number, "cvv": cvv },
        "extra": extra,
    }))
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn authenticate(&self) -> AppResult<String> {
        self.ensure_online("authenticate")?;
        Ok(self.next_id("mock-session"))
    }

    async fn sale_card(
        &self,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("sale")?;
        let request = card_request(card, cvv, json!({ "order_id": order_id, "amount": amount }));
        self.card_sale(request, order_id, amount, card, cvv)
    }

    async fn sale_account(
        &self,
        order_id: &str,
        amount: Decimal,
        account: &AccountDetails,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("sale")?;
        let request = redact_json(&json!({
            "order_id": order_id,
            "amount": amount,
            "echeck": { "account_number": account.account_number },
        }));
        self.open_transaction(request, Some(order_id), amount)
    }

    async fn sale_card_recur(
        &self,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
        payment_term: i32,
        installment_date: NaiveDate,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("sale")?;
        let request = card_request(
            card,
            cvv,
            json!({ "order_id": order_id, "payment_term": payment_term, "installment_date": installment_date }),
        );
        self.card_sale(request, order_id, amount, card, cvv)
    }

    async fn create_consent_card(
        &self,
        terms: &ConsentTerms,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("consent")?;
        let request = card_request(card, cvv, json!({ "terms": terms }));
        if !valid_cvv(cvv) || card.number.ends_with(DECLINED_CARD_SUFFIX) {
            return Ok(Self::declined(request, "consent declined"));
        }
        let consent_id = self.next_id("mock-consent");
        self.consents
            .lock()
            .map_err(|_| AppError::Internal("mock gateway state poisoned".to_string()))?
            .insert(consent_id.clone(), terms.emi_amount);
        let response = json!({ "consent_id": consent_id, "consent_days": terms.consent_days });
        Ok(GatewayResponse {
            success: true,
            transaction_id: Some(consent_id),
            status: None,
            data: response.clone(),
            error: None,
            exchange: Self::exchange(request, &response),
        })
    }

    async fn create_consent_account(&self, account: &AccountDetails) -> AppResult<GatewayResponse> {
        self.ensure_online("consent")?;
        let request = redact_json(&json!({ "echeck": { "account_number": account.account_number } }));
        let consent_id = self.next_id("mock-consent");
        self.consents
            .lock()
            .map_err(|_| AppError::Internal("mock gateway state poisoned".to_string()))?
            .insert(consent_id.clone(), Decimal::ZERO);
        let response = json!({ "consent_id": consent_id });
        Ok(GatewayResponse {
            success: true,
            transaction_id: Some(consent_id),
            status: None,
            data: response.clone(),
            error: None,
            exchange: Self::exchange(request, &response),
        })
    }

    async fn charge_consent_card(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse> {
        self.charge_consent_account(consent_id, order_id, amount).await
    }

    async fn charge_consent_account(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("consent charge")?;
        let request = json!({ "consent_id": consent_id, "order_id": order_id, "amount": amount });
        let known = self
            .consents
            .lock()
            .map_err(|_| AppError::Internal("mock gateway state poisoned".to_string()))?
            .contains_key(consent_id);
        if !known {
            return Ok(Self::declined(request, "unknown consent"));
        }
        self.open_transaction(request, Some(order_id), amount)
    }

    async fn query_transaction(
        &self,
        transaction_id: Option<&str>,
        _method: PaymentMethod,
        payment_id: Uuid,
    ) -> AppResult<QueryResponse> {
        self.ensure_online("query")?;
        let order_id = payment_id.to_string();
        let txs = self.lock_transactions()?;
        let found = match transaction_id {
            Some(id) => txs.get(id).map(|t| (id.to_string(), t.clone())),
            None => txs
                .iter()
                .find(|(_, t)| t.order_id.as_deref() == Some(order_id.as_str()))
                .map(|(id, t)| (id.clone(), t.clone())),
        };
        let transaction = found.map(|(id, t)| GatewayTransaction {
            transaction_id: id,
            order_id: t.order_id,
            status: t.status,
            amount: t.amount,
        });
        let request = json!({ "transaction_id": transaction_id, "order_id": order_id });
        let response = json!({ "transaction": transaction });
        Ok(QueryResponse {
            error: transaction.is_none().then(|| "transaction not found".to_string()),
            transaction,
            exchange: Self::exchange(request, &response),
        })
    }

    async fn cancel_transaction(
        &self,
        transaction_id: &str,
        _method: PaymentMethod,
    ) -> AppResult<GatewayResponse> {
        self.ensure_online("void")?;
        let request = json!({ "transaction_id": transaction_id });
        let mut txs = self.lock_transactions()?;
        let Some(tx) = txs.get_mut(transaction_id) else {
            return Ok(Self::declined(request, "transaction not found"));
        };
        if tx.status != GatewayStatus::Open {
            return Ok(Self::declined(request, "only OPEN transactions can be voided"));
        }
        tx.status = GatewayStatus::Voided;
        let response = json!({ "transaction_id": transaction_id, "status": "VOIDED" });
        Ok(GatewayResponse {
            success: true,
            transaction_id: Some(transaction_id.to_string()),
            status: Some(GatewayStatus::Voided),
            data: Value::Null,
            error: None,
            exchange: Self::exchange(request, &response),
        })
    }

    async fn refund_transaction(
        &self,
        parent_id: Uuid,
        transaction_id: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> AppResult<RefundResponse> {
        self.ensure_online("refund")?;
        let status = self.status_of(transaction_id);
        match status {
            Some(GatewayStatus::Open) => {
                let void = self.cancel_transaction(transaction_id, method).await?;
                Ok(RefundResponse {
                    success: void.success,
                    methodology: Some(RefundMethodology::Void),
                    transaction_id: void.transaction_id,
                    error: void.error,
                    exchange: void.exchange,
                })
            }
            Some(GatewayStatus::Settled | GatewayStatus::CreditApplied) => {
                let request = json!({ "transaction_id": transaction_id, "amount": amount, "reference": parent_id });
                let mut txs = self.lock_transactions()?;
                let Some(tx) = txs.get_mut(transaction_id) else {
                    return Err(AppError::NoTransactionFound(transaction_id.to_string()));
                };
                let success = tx.credited + amount <= tx.amount;
                if success {
                    tx.credited += amount;
                    tx.status = GatewayStatus::CreditApplied;
                }
                let response = json!({ "success": success, "credited": tx.credited });
                Ok(RefundResponse {
                    success,
                    methodology: Some(RefundMethodology::ApplyCredit),
                    transaction_id: success.then(|| self.next_id("mock-credit")),
                    error: (!success).then(|| "credit exceeds transaction amount".to_string()),
                    exchange: Self::exchange(request, &response),
                })
            }
            other => {
                let request = json!({ "transaction_id": transaction_id, "amount": amount });
                let response = json!({ "status": other });
                Ok(RefundResponse {
                    success: false,
                    methodology: None,
                    transaction_id: None,
                    error: Some(format!("transaction cannot be refunded in status {:?}", other)),
                    exchange: Self::exchange(request, &response),
                })
            }
        }
    }

    async fn reconcile(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        query: ReconcileQuery,
    ) -> AppResult<ReconcileResponse> {
        self.ensure_online("reconcile")?;
        let txs = self.lock_transactions()?;
        let transactions: Vec<GatewayTransaction> = txs
            .iter()
            .filter(|(_, t)| query == ReconcileQuery::All || t.status == GatewayStatus::Settled)
            .map(|(id, t)| GatewayTransaction {
                transaction_id: id.clone(),
                order_id: t.order_id.clone(),
                status: t.status,
                amount: t.amount,
            })
            .collect();
        let request = json!({ "start_date": start_date, "end_date": end_date, "query": query });
        let response = json!({ "count": transactions.len() });
        Ok(ReconcileResponse {
            success: true,
            request_id: Some(self.next_id("mock-recon")),
            transactions,
            error_code: None,
            error_message: None,
            exchange: Self::exchange(request, &response),
        })
    }

    async fn prepare_request_for_pos_payment(
        &self,
        payment: &Payment,
        amount: Decimal,
    ) -> AppResult<Value> {
        let session_key = self.authenticate().await?;
        Ok(json!({
            "session_key": session_key,
            "order_id": payment.order_id,
            "amount": amount,
            "currency": payment.currency,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn card(number: &str) -> CardDetails {
        CardDetails {
            number: number.to_string(),
            expiry_month: 12,
            expiry_year: 2030,
            holder_name: None,
            brand: None,
        }
    }

    #[tokio::test]
    async fn open_sale_refunds_by_void_and_settled_by_credit() {
        let gw = MockGateway::new();
        let open = gw
            .sale_card("o-1", dec!(100), &card("4111111111111111"), "123")
            .await
            .unwrap();
        let open_id = open.transaction_id.unwrap();
        let refund = gw
            .refund_transaction(Uuid::new_v4(), &open_id, dec!(100), PaymentMethod::CreditCard)
            .await
            .unwrap();
        assert_eq!(refund.methodology, Some(RefundMethodology::Void));
        assert_eq!(gw.status_of(&open_id), Some(GatewayStatus::Voided));

        let settled = gw
            .sale_card("o-2", dec!(100), &card("4111111111111111"), "123")
            .await
            .unwrap();
        let settled_id = settled.transaction_id.unwrap();
        gw.settle(&settled_id).unwrap();
        let credit = gw
            .refund_transaction(Uuid::new_v4(), &settled_id, dec!(40), PaymentMethod::CreditCard)
            .await
            .unwrap();
        assert!(credit.success);
        assert_eq!(credit.methodology, Some(RefundMethodology::ApplyCredit));
    }

    #[tokio::test]
    async fn declines_and_offline() {
        let gw = MockGateway::new();
        let declined = gw
            .sale_card("o-1", dec!(10), &card("4000000000000002"), "123")
            .await
            .unwrap();
        assert!(!declined.success);

        gw.set_offline(true);
        assert!(matches!(
            gw.sale_card("o-2", dec!(10), &card("4111111111111111"), "123").await,
            Err(AppError::Gateway(_))
        ));
    }

    #[tokio::test]
    async fn card_numbers_never_reach_the_exchange_in_clear() {
        let gw = MockGateway::new();
        let sale = gw
            .sale_card("o-1", dec!(10), &card("4111111111111111"), "123")
            .await
            .unwrap();
        let logged = sale.exchange.request.to_string();
        assert!(!logged.contains("4111111111111111"));
        assert!(!logged.contains("\"123\""));
    }
}
