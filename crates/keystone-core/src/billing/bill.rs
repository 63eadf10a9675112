use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::breakdown::LineCalculation;
use super::rules::{AppliedAmount, Ledger};
use super::tax::TaxRule;
use crate::error::{AppError, AppResult};
use crate::models::{Bill, BillStatus, RuleKind, RuleSpec};
use crate::money::round2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillTotals {
    pub total_charges: Decimal,
    pub insurance_paid: Decimal,
    /// Sum of line patient amounts (each with its own line tax).
    pub lines_patient_amount: Decimal,
    pub other_adjustment: Decimal,
    pub other_discount: Decimal,
    pub other_writeoff: Decimal,
    pub taxable_amount: Decimal,
    pub other_tax: Decimal,
    pub patient_amount: Decimal,
    pub applied: Vec<AppliedAmount>,
}

/// Aggregate priced lines and apply bill-level rules against `total_charges`.
///
/// The bill tax is recomputed on the residual taxable base with secondary semantics; when
/// the tax is flat, the per-line flat charges are carried instead.
pub fn calculate_bill(
    lines: &[LineCalculation],
    adjustments: &[RuleSpec],
    discounts: &[RuleSpec],
    writeoffs: &[RuleSpec],
    tax_rule: &TaxRule,
) -> BillTotals {
    let total_charges: Decimal = lines.iter().map(|l| l.total_amount).sum();
    let insurance_paid: Decimal = lines.iter().map(|l| l.insurance_amount).sum();
    let lines_patient_amount: Decimal = lines.iter().map(|l| l.patient_amount).sum();
    let line_taxable: Decimal = lines
        .iter()
        .filter(|l| l.tax > Decimal::ZERO)
        .map(|l| l.taxable_amount)
        .sum();

    let mut ledger = Ledger::new(total_charges, line_taxable);
    ledger.apply_group(RuleKind::Adjustment, adjustments, total_charges);
    ledger.apply_group(RuleKind::Discount, discounts, total_charges);
    ledger.apply_group(RuleKind::WriteOff, writeoffs, total_charges);
    ledger.clamp();

    let carried_line_tax: Decimal = if tax_rule.is_flat() {
        lines.iter().map(|l| l.tax).sum()
    } else {
        Decimal::ZERO
    };
    let other_tax = tax_rule.apply_secondary(ledger.taxable) + carried_line_tax;

    BillTotals {
        total_charges: round2(total_charges),
        insurance_paid: round2(insurance_paid),
        lines_patient_amount: round2(lines_patient_amount),
        other_adjustment: ledger.sum_of(RuleKind::Adjustment),
        other_discount: -ledger.sum_of(RuleKind::Discount),
        other_writeoff: -ledger.sum_of(RuleKind::WriteOff),
        taxable_amount: round2(ledger.taxable),
        other_tax: round2(other_tax),
        patient_amount: round2(ledger.total + other_tax),
        applied: ledger.applied,
    }
}

/// Copy computed totals onto the bill row.
pub fn apply_totals(bill: &mut Bill, totals: &BillTotals) {
    bill.total_charges = totals.total_charges;
    bill.insurance_paid = totals.insurance_paid;
    bill.patient_amount = totals.patient_amount;
    bill.other_adjustment = totals.other_adjustment;
    bill.other_discount = totals.other_discount;
    bill.other_writeoff = totals.other_writeoff;
    bill.other_tax = totals.other_tax;
}

/// Cancel a PENDING bill. `cancellation_code` must already be resolved from the reason.
pub fn cancel(bill: &mut Bill, reason: &str, cancellation_code: Option<String>) -> AppResult<()> {
    if reason.trim().is_empty() {
        return Err(AppError::MissingRequiredParam(
            "cancellation_reason".to_string(),
        ));
    }
    if bill.status != BillStatus::Pending {
        return Err(AppError::InvalidStatusForCancellation(format!(
            "bill {} is {:?}",
            bill.display_id, bill.status
        )));
    }
    let code = cancellation_code.ok_or_else(|| {
        AppError::InvalidInput(format!("unknown cancellation reason '{}'", reason))
    })?;
    bill.status = BillStatus::Cancelled;
    bill.cancellation_reason = Some(reason.to_string());
    bill.cancellation_code = Some(code);
    Ok(())
}

/// Bills may only be recalculated while nothing has been collected.
pub fn ensure_editable(bill: &Bill) -> AppResult<()> {
    if bill.status != BillStatus::Pending || bill.paid_amount > Decimal::ZERO {
        return Err(AppError::InvalidStatus(format!(
            "bill {} can no longer be edited",
            bill.display_id
        )));
    }
    Ok(())
}

/// Record a settled payment amount; COMPLETED stamps `paid_date`.
pub fn record_payment(bill: &mut Bill, amount: Decimal, today: NaiveDate) {
    bill.paid_amount = round2(bill.paid_amount + amount);
    if bill.paid_amount >= bill.patient_amount {
        mark_completed(bill, today);
    } else if bill.paid_amount > Decimal::ZERO && bill.status != BillStatus::OnPp {
        bill.status = BillStatus::PartiallyCompleted;
    }
}

pub fn mark_completed(bill: &mut Bill, today: NaiveDate) {
    bill.status = BillStatus::Completed;
    bill.paid_date = Some(today);
}

/// Undo a previously recorded amount after a void.
pub fn reverse_payment(bill: &mut Bill, amount: Decimal) {
    bill.paid_amount = round2((bill.paid_amount - amount).max(Decimal::ZERO));
    bill.paid_date = None;
    bill.status = if bill.paid_amount > Decimal::ZERO {
        BillStatus::PartiallyCompleted
    } else {
        BillStatus::Pending
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::breakdown::calculate_line;
    use crate::models::{BreakdownInput, RuleType};
    use rust_decimal_macros::dec;

    fn ca_tax() -> TaxRule {
        TaxRule {
            tax_type: RuleType::Percent,
            value: dec!(10),
            max_upto: None,
        }
    }

    fn line(unit: Decimal, qty: Decimal) -> BreakdownInput {
        BreakdownInput {
            category: "Amenities".to_string(),
            type_of_service: "Guest suite".to_string(),
            description: None,
            unit_amount: unit,
            service_taxable: true,
            quantity: qty,
            insurance_amount: Decimal::ZERO,
            other_fees: Decimal::ZERO,
            other_fees_taxable: false,
            adjustments: vec![],
            discounts: vec![],
            writeoffs: vec![],
            currency: Some("USD".to_string()),
            service_start_date: None,
            service_end_date: None,
        }
    }

    fn ten_percent_discount() -> RuleSpec {
        RuleSpec {
            name: "promo".to_string(),
            rule_type: RuleType::Percent,
            value: dec!(10),
            max_upto: None,
            taxable: true,
            direction: None,
        }
    }

    #[test]
    fn bill_with_tax_and_discount() {
        let lines = vec![calculate_line(&line(dec!(100.00), dec!(2)), &ca_tax()).unwrap()];
        let totals = calculate_bill(&lines, &[], &[ten_percent_discount()], &[], &ca_tax());

        assert_eq!(totals.total_charges, dec!(200.00));
        assert_eq!(totals.taxable_amount, dec!(180.00));
        assert_eq!(totals.other_tax, dec!(18.00));
        assert_eq!(totals.patient_amount, dec!(198.00));
        assert_eq!(totals.other_discount, dec!(20.00));
    }

    #[test]
    fn recalculation_is_idempotent() {
        let lines = vec![
            calculate_line(&line(dec!(33.33), dec!(3)), &ca_tax()).unwrap(),
            calculate_line(&line(dec!(12.5), dec!(1)), &ca_tax()).unwrap(),
        ];
        let a = calculate_bill(&lines, &[], &[ten_percent_discount()], &[], &ca_tax());
        let b = calculate_bill(&lines, &[], &[ten_percent_discount()], &[], &ca_tax());
        assert_eq!(a, b);
    }

    #[test]
    fn flat_tax_is_carried_from_lines() {
        let flat = TaxRule {
            tax_type: RuleType::Flat,
            value: dec!(2),
            max_upto: None,
        };
        let lines = vec![
            calculate_line(&line(dec!(10), dec!(1)), &flat).unwrap(),
            calculate_line(&line(dec!(20), dec!(1)), &flat).unwrap(),
        ];
        let totals = calculate_bill(&lines, &[], &[], &[], &flat);
        assert_eq!(totals.other_tax, dec!(4));
        assert_eq!(totals.patient_amount, dec!(34));
    }

    #[test]
    fn equation_holds() {
        let lines = vec![calculate_line(&line(dec!(100), dec!(2)), &ca_tax()).unwrap()];
        let totals = calculate_bill(&lines, &[], &[ten_percent_discount()], &[], &ca_tax());
        let rules_at_bill_level: Decimal = totals.applied.iter().map(|a| a.amount).sum();
        assert_eq!(
            totals.patient_amount,
            totals.total_charges + rules_at_bill_level + totals.other_tax
        );
    }
}
