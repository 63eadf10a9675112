use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "bill_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Pending,
    PartiallyCompleted,
    Completed,
    Failed,
    Cancelled,
    OnPp,
    Refunded,
    PartiallyRefunded,
    RefundInitiated,
    PartialRefundInitiated,
    RefundFailed,
    PartialRefundFailed,
}

impl BillStatus {
    /// Statuses from which a refund request may be opened.
    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            BillStatus::Completed
                | BillStatus::PartiallyCompleted
                | BillStatus::PartiallyRefunded
                | BillStatus::RefundFailed
                | BillStatus::PartialRefundFailed
        )
    }

    /// Statuses that accept a new payment.
    pub fn is_payable(&self) -> bool {
        matches!(
            self,
            BillStatus::Pending | BillStatus::PartiallyCompleted | BillStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "rule_type", rename_all = "UPPERCASE"))]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    Percent,
    Flat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "adjustment_direction", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdjustmentDirection {
    Pos,
    Neg,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "rule_kind", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    Discount,
    Adjustment,
    WriteOff,
}

/// Describes a discount, adjustment or write-off as supplied by the caller or a master rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: Decimal,
    pub max_upto: Option<Decimal>,
    /// Whether the rule also moves the taxable base.
    #[serde(default = "default_taxable")]
    pub taxable: bool,
    /// Only meaningful for adjustments; defaults to positive.
    #[serde(default)]
    pub direction: Option<AdjustmentDirection>,
}

fn default_taxable() -> bool {
    true
}

/// Snapshot of a rule as applied to a bill (`breakdown_id` is None) or to one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AppliedRule {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub bill_id: Uuid,
    pub breakdown_id: Option<Uuid>,
    pub kind: RuleKind,
    pub name: String,
    pub rule_type: RuleType,
    pub value: Decimal,
    pub max_upto: Option<Decimal>,
    pub direction: Option<AdjustmentDirection>,
    /// Signed effect on the running total.
    pub amount: Decimal,
    pub taxable: bool,
}

/// Master discount/adjustment/write-off rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct MasterRule {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub kind: RuleKind,
    pub name: String,
    pub rule_type: RuleType,
    pub value: Decimal,
    pub max_upto: Option<Decimal>,
    pub direction: Option<AdjustmentDirection>,
    pub taxable: bool,
    pub active: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub frequency: Option<String>,
    pub applicable_charges: Vec<String>,
    pub free_percentage: Option<Decimal>,
    pub maximum_cap: Option<Decimal>,
    pub waved_fee: Option<Decimal>,
}

impl MasterRule {
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.active
            && self.start_date.map_or(true, |s| s <= date)
            && self.end_date.map_or(true, |e| date <= e)
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            name: self.name.clone(),
            rule_type: self.rule_type,
            value: self.value,
            max_upto: self.max_upto,
            taxable: self.taxable,
            direction: self.direction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TaxPerState {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub state: String,
    pub tax_type: RuleType,
    pub value: Decimal,
    pub max_upto: Option<Decimal>,
    pub active: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Catalog entry for a billable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TypeOfService {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub category: String,
    pub amount: Decimal,
    pub taxable: bool,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Bill {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub display_id: String,
    pub resident_id: Uuid,
    pub location_id: Option<Uuid>,
    pub service_description: Option<String>,
    pub service_date: NaiveDate,
    pub statement_date: NaiveDate,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub status: BillStatus,
    pub currency: String,
    pub tax_state: Option<String>,
    pub total_charges: Decimal,
    pub insurance_paid: Decimal,
    pub patient_amount: Decimal,
    pub other_discount: Decimal,
    pub other_adjustment: Decimal,
    pub other_writeoff: Decimal,
    pub other_tax: Decimal,
    pub paid_amount: Decimal,
    pub refunded_amount: Decimal,
    pub cancellation_reason: Option<String>,
    pub cancellation_code: Option<String>,
}

impl Bill {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }

    pub fn balance_due(&self) -> Decimal {
        (self.patient_amount - self.paid_amount).max(Decimal::ZERO)
    }

    /// Amount that may still be refunded.
    pub fn total_refundable_amount(&self) -> Decimal {
        (self.paid_amount - self.refunded_amount).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BillBreakDown {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub bill_id: Uuid,
    pub position: i32,
    pub category: String,
    pub type_of_service: String,
    pub description: Option<String>,
    pub quantity: Decimal,
    /// Unit price at the time of billing.
    pub type_of_service_amount: Decimal,
    pub service_taxable: bool,
    pub other_fees: Decimal,
    pub other_fees_taxable: bool,
    pub insurance_amount: Decimal,
    pub sub_total: Decimal,
    pub taxable_amount: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub patient_amount: Decimal,
    pub currency: String,
    pub service_start_date: Option<NaiveDate>,
    pub service_end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BillSummary {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub bill_id: Uuid,
    pub position: i32,
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
}

/// A bill with every row that is rewritten on recalculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillAggregate {
    pub bill: Bill,
    pub breakdowns: Vec<BillBreakDown>,
    pub applied: Vec<AppliedRule>,
    pub summaries: Vec<BillSummary>,
}

/// One line of a bill create/update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakdownInput {
    pub category: String,
    pub type_of_service: String,
    pub description: Option<String>,
    pub unit_amount: Decimal,
    #[serde(default)]
    pub service_taxable: bool,
    pub quantity: Decimal,
    #[serde(default)]
    pub insurance_amount: Decimal,
    #[serde(default)]
    pub other_fees: Decimal,
    #[serde(default)]
    pub other_fees_taxable: bool,
    #[serde(default)]
    pub adjustments: Vec<RuleSpec>,
    #[serde(default)]
    pub discounts: Vec<RuleSpec>,
    #[serde(default)]
    pub writeoffs: Vec<RuleSpec>,
    pub currency: Option<String>,
    pub service_start_date: Option<NaiveDate>,
    pub service_end_date: Option<NaiveDate>,
}

/// Bill create/update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillInput {
    pub resident_id: Uuid,
    pub location_id: Option<Uuid>,
    pub service_description: Option<String>,
    pub service_date: NaiveDate,
    pub statement_date: NaiveDate,
    pub due_date: NaiveDate,
    pub tax_state: Option<String>,
    pub breakdown: Vec<BreakdownInput>,
    #[serde(default)]
    pub adjustments: Vec<RuleSpec>,
    #[serde(default)]
    pub discounts: Vec<RuleSpec>,
    #[serde(default)]
    pub writeoffs: Vec<RuleSpec>,
}
