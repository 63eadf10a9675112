use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use keystone_core::models::{AccountDetails, CardDetails, GatewayStatus, Payment, PaymentMethod};
use keystone_core::payments::RefundMethodology;
use keystone_core::{AppError, AppResult, GatewaySettings};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    ConsentTerms, GatewayExchange, GatewayResponse, GatewayTransaction, PaymentGateway,
    QueryResponse, ReconcileQuery, ReconcileResponse, RefundResponse,
};

/// Reply envelope of the processor's JSON API.
#[derive(Debug, Default, Deserialize)]
struct VendorReply {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    consent_id: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<GatewayStatus>,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl VendorReply {
    fn transaction(&self) -> Option<GatewayTransaction> {
        Some(GatewayTransaction {
            transaction_id: self.transaction_id.clone()?,
            order_id: self.order_id.clone(),
            status: self.status?,
            amount: self.amount.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct VendorList {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    transactions: Vec<VendorReply>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Processor client speaking JSON over HTTPS.
pub struct HttpGateway {
    http_client: Client,
    settings: GatewaySettings,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.settings.base_url)
            .finish()
    }
}

fn card_body(card: &CardDetails, cvv: &str) -> Value {
    json!({
        "card_number": card.number,
        "expiry_month": card.expiry_month,
        "expiry_year": card.expiry_year,
        "holder_name": card.holder_name,
        "cvv": cvv,
    })
}

fn account_body(account: &AccountDetails) -> Value {
    json!({
        "account_number": account.account_number,
        "routing_number": account.routing_number,
        "account_type": account.account_type,
        "holder_name": account.holder_name,
    })
}

fn method_kind(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::BankTransfer => "ach",
        _ => "card",
    }
}

impl HttpGateway {
    pub fn new(settings: GatewaySettings) -> AppResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create gateway HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    /// Send one call. Non-2xx answers come back as data; only transport failures error.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<(bool, Value, GatewayExchange)> {
        let mut request = self.http_client.request(method.clone(), self.url(path));
        if let Some(key) = &self.settings.api_key {
            request = request.header("x-api-key", key);
        }
        if let Some(merchant) = &self.settings.merchant_id {
            request = request.header("x-merchant-id", merchant);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, path = %path, timeout = e.is_timeout(), "Gateway call failed");
            AppError::Gateway(if e.is_timeout() {
                format!("{} timed out", path)
            } else {
                format!("{} unreachable", path)
            })
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::Gateway(format!("Failed to read gateway response: {}", e)))?;
        let value: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));

        if !status.is_success() {
            tracing::warn!(path = %path, status = %status, "Gateway declined request");
        }

        let exchange = GatewayExchange {
            request: json!({ "method": method.as_str(), "path": path, "body": body }),
            response: json!({ "status": status.as_u16(), "body": value }),
        };
        Ok((status.is_success(), value, exchange))
    }

    async fn transact(&self, path: &str, body: Value) -> AppResult<GatewayResponse> {
        let (ok, value, exchange) = self.call(Method::POST, path, Some(body)).await?;
        let reply: VendorReply = serde_json::from_value(value.clone()).unwrap_or_default();
        let success = ok && reply.status != Some(GatewayStatus::Failed);
        Ok(GatewayResponse {
            success,
            transaction_id: reply.transaction_id.or(reply.consent_id),
            status: reply.status,
            data: reply.data.unwrap_or(Value::Null),
            error: if success { None } else { reply.message.or(Some(value.to_string())) },
            exchange,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn authenticate(&self) -> AppResult<String> {
        let (ok, value, _) = self.call(Method::POST, "v1/sessions", None).await?;
        if !ok {
            return Err(AppError::Gateway("authentication rejected".to_string()));
        }
        value
            .get("session_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Gateway("session_key missing from response".to_string()))
    }

    async fn sale_card(
        &self,
        order_id: &str,
        amount: Decimal,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            "v1/sales",
            json!({ "order_id": order_id, "amount": amount, "card": card_body(card, cvv) }),
        )
        .await
    }

    async fn sale_account(
        &self,
        order_id: &str,
        amount: Decimal,
        account: &AccountDetails,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            "v1/sales",
            json!({ "order_id": order_id, "amount": amount, "echeck": account_body(account) }),
        )
        .await
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
        self.transact(
            "v1/sales",
            json!({
                "order_id": order_id,
                "amount": amount,
                "card": card_body(card, cvv),
                "recurring": { "payment_term": payment_term, "installment_date": installment_date },
            }),
        )
        .await
    }

    async fn create_consent_card(
        &self,
        terms: &ConsentTerms,
        card: &CardDetails,
        cvv: &str,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            "v1/consents",
            json!({
                "full_amount": terms.full_amount,
                "emi_amount": terms.emi_amount,
                "consent_days": terms.consent_days,
                "start_date": terms.start_date,
                "card": card_body(card, cvv),
            }),
        )
        .await
    }

    async fn create_consent_account(&self, account: &AccountDetails) -> AppResult<GatewayResponse> {
        self.transact("v1/consents", json!({ "echeck": account_body(account) }))
            .await
    }

    async fn charge_consent_card(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            &format!("v1/consents/{}/charges", consent_id),
            json!({ "order_id": order_id, "amount": amount, "kind": "card" }),
        )
        .await
    }

    async fn charge_consent_account(
        &self,
        consent_id: &str,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            &format!("v1/consents/{}/charges", consent_id),
            json!({ "order_id": order_id, "amount": amount, "kind": "ach" }),
        )
        .await
    }

    async fn query_transaction(
        &self,
        transaction_id: Option<&str>,
        method: PaymentMethod,
        payment_id: Uuid,
    ) -> AppResult<QueryResponse> {
        let path = match transaction_id {
            Some(id) => format!("v1/transactions/{}?kind={}", id, method_kind(method)),
            None => format!(
                "v1/transactions?order_id={}&kind={}",
                payment_id,
                method_kind(method)
            ),
        };
        let (ok, value, exchange) = self.call(Method::GET, &path, None).await?;
        if !ok {
            return Ok(QueryResponse {
                transaction: None,
                error: Some(value.to_string()),
                exchange,
            });
        }

        // Lookups by order id answer with a list.
        let reply = match transaction_id {
            Some(_) => serde_json::from_value::<VendorReply>(value).unwrap_or_default(),
            None => serde_json::from_value::<VendorList>(value)
                .unwrap_or_default()
                .transactions
                .into_iter()
                .next()
                .unwrap_or_default(),
        };
        Ok(QueryResponse {
            transaction: reply.transaction(),
            error: None,
            exchange,
        })
    }

    async fn cancel_transaction(
        &self,
        transaction_id: &str,
        method: PaymentMethod,
    ) -> AppResult<GatewayResponse> {
        self.transact(
            &format!("v1/transactions/{}/void", transaction_id),
            json!({ "kind": method_kind(method) }),
        )
        .await
    }

    async fn refund_transaction(
        &self,
        parent_id: Uuid,
        transaction_id: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> AppResult<RefundResponse> {
        let query = self
            .query_transaction(Some(transaction_id), method, parent_id)
            .await?;
        let Some(current) = query.transaction else {
            return Ok(RefundResponse {
                success: false,
                methodology: None,
                transaction_id: None,
                error: Some(format!("transaction {} not found", transaction_id)),
                exchange: query.exchange,
            });
        };

        let (methodology, reply) = match current.status {
            GatewayStatus::Open => (
                RefundMethodology::Void,
                self.cancel_transaction(transaction_id, method).await?,
            ),
            GatewayStatus::Settled | GatewayStatus::CreditApplied => (
                RefundMethodology::ApplyCredit,
                self.transact(
                    &format!("v1/transactions/{}/credits", transaction_id),
                    json!({ "amount": amount, "reference": parent_id, "kind": method_kind(method) }),
                )
                .await?,
            ),
            other => {
                return Ok(RefundResponse {
                    success: false,
                    methodology: None,
                    transaction_id: None,
                    error: Some(format!("transaction is {:?}", other)),
                    exchange: query.exchange,
                })
            }
        };

        Ok(RefundResponse {
            success: reply.success,
            methodology: Some(methodology),
            transaction_id: reply.transaction_id,
            error: reply.error,
            exchange: reply.exchange,
        })
    }

    async fn reconcile(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        query: ReconcileQuery,
    ) -> AppResult<ReconcileResponse> {
        let query_type = match query {
            ReconcileQuery::Settled => "settled",
            ReconcileQuery::All => "all",
        };
        let path = format!(
            "v1/transactions?start_date={}&end_date={}&query_type={}",
            start_date, end_date, query_type
        );
        let (ok, value, exchange) = self.call(Method::GET, &path, None).await?;
        let list: VendorList = serde_json::from_value(value).unwrap_or_default();
        Ok(ReconcileResponse {
            success: ok,
            request_id: list.request_id,
            transactions: list
                .transactions
                .iter()
                .filter_map(VendorReply::transaction)
                .collect(),
            error_code: list.error_code,
            error_message: list.message,
            exchange,
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
            "merchant_id": self.settings.merchant_id,
            "order_id": payment.order_id,
            "amount": amount,
            "currency": payment.currency,
            "endpoint": self.url("v1/pos"),
        }))
    }
}
