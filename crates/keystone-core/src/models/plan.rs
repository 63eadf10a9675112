use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuditEnvelope, PaymentMethod, RuleType};

/// Payment plan offered to residents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PaymentPlan {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    /// Number of monthly installments.
    pub duration: i32,
    pub interest_rate: Decimal,
    pub type_of_interest: RuleType,
    pub other_fees: Decimal,
    pub type_processing_fee: RuleType,
    pub interest_taxable: bool,
    pub other_fees_taxable: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub active: bool,
}

impl PaymentPlan {
    pub fn is_offered_on(&self, date: NaiveDate) -> bool {
        self.active
            && self.start_date.map_or(true, |s| s <= date)
            && self.end_date.map_or(true, |e| date <= e)
    }
}

/// A plan bound to one bill, with the figures computed at consent time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BillPaymentPlan {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub bill_id: Uuid,
    pub payment_plan_id: Uuid,
    pub duration: i32,
    pub interest_rate: Decimal,
    pub type_of_interest: RuleType,
    pub fees: Decimal,
    pub interest_amount: Decimal,
    pub tax: Decimal,
    pub payable_amount_using_pp: Decimal,
    pub emi: Decimal,
    pub paid_amount: Decimal,
    pub installments_paid: i32,
    pub start_date: NaiveDate,
    pub day_of_month: i16,
    pub consent_id: String,
    pub payment_method: PaymentMethod,
    pub consent_response: serde_json::Value,
    pub last_charged_on: Option<DateTime<Utc>>,
    pub active: bool,
}

impl BillPaymentPlan {
    pub fn remaining_installments(&self) -> i32 {
        (self.duration - self.installments_paid).max(0)
    }
}
