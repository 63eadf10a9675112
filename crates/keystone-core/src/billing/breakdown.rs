use rust_decimal::Decimal;

use super::rules::{AppliedAmount, Ledger};
use super::tax::TaxRule;
use crate::error::{AppError, AppResult};
use crate::models::{BreakdownInput, RuleKind};
use crate::money::round2;

/// Priced line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCalculation {
    pub sub_total: Decimal,
    pub insurance_amount: Decimal,
    pub other_fees: Decimal,
    pub taxable_amount: Decimal,
    /// Line total before tax.
    pub total_amount: Decimal,
    pub tax: Decimal,
    pub patient_amount: Decimal,
    pub applied: Vec<AppliedAmount>,
}

impl LineCalculation {
    pub fn sum_of(&self, kind: RuleKind) -> Decimal {
        self.applied
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.amount)
            .sum()
    }
}

pub fn validate_line(input: &BreakdownInput) -> AppResult<()> {
    if input.quantity <= Decimal::ZERO {
        return Err(AppError::InvalidInput(format!(
            "quantity must be positive for '{}'",
            input.type_of_service
        )));
    }
    if input.unit_amount < Decimal::ZERO
        || input.insurance_amount < Decimal::ZERO
        || input.other_fees < Decimal::ZERO
    {
        return Err(AppError::InvalidAmount(format!(
            "amounts must not be negative for '{}'",
            input.type_of_service
        )));
    }
    Ok(())
}

pub fn calculate_line(input: &BreakdownInput, tax_rule: &TaxRule) -> AppResult<LineCalculation> {
    validate_line(input)?;

    let sub_total = round2(input.unit_amount * input.quantity);
    let after_insurance = sub_total - input.insurance_amount;
    let mut ledger = Ledger::new(after_insurance, after_insurance);

    ledger.total += input.other_fees;
    if input.other_fees_taxable {
        ledger.taxable += input.other_fees;
    }

    ledger.apply_group(RuleKind::Adjustment, &input.adjustments, sub_total);
    ledger.apply_group(RuleKind::Discount, &input.discounts, sub_total);
    ledger.apply_group(RuleKind::WriteOff, &input.writeoffs, sub_total);
    ledger.clamp();

    let tax = if input.service_taxable && ledger.taxable > Decimal::ZERO {
        tax_rule.apply(ledger.taxable)
    } else {
        Decimal::ZERO
    };

    let total_amount = round2(ledger.total);
    Ok(LineCalculation {
        sub_total,
        insurance_amount: input.insurance_amount,
        other_fees: input.other_fees,
        taxable_amount: round2(ledger.taxable),
        total_amount,
        tax,
        patient_amount: total_amount + tax,
        applied: ledger.applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleSpec, RuleType};
    use rust_decimal_macros::dec;

    fn line(unit: Decimal, qty: Decimal) -> BreakdownInput {
        BreakdownInput {
            category: "Amenities".to_string(),
            type_of_service: "Clubhouse rental".to_string(),
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

    fn ten_percent() -> TaxRule {
        TaxRule {
            tax_type: RuleType::Percent,
            value: dec!(10),
            max_upto: None,
        }
    }

    #[test]
    fn simple_taxable_line() {
        let calc = calculate_line(&line(dec!(100), dec!(2)), &ten_percent()).unwrap();
        assert_eq!(calc.sub_total, dec!(200));
        assert_eq!(calc.tax, dec!(20));
        assert_eq!(calc.patient_amount, dec!(220));
    }

    #[test]
    fn insurance_fees_and_discount() {
        let mut input = line(dec!(100), dec!(1));
        input.insurance_amount = dec!(30);
        input.other_fees = dec!(10);
        input.other_fees_taxable = false;
        input.discounts = vec![RuleSpec {
            name: "loyalty".to_string(),
            rule_type: RuleType::Percent,
            value: dec!(10),
            max_upto: None,
            taxable: true,
            direction: None,
        }];

        let calc = calculate_line(&input, &ten_percent()).unwrap();

        // 100 - 30 + 10 - 10% of sub_total(100)
        assert_eq!(calc.total_amount, dec!(70));
        // taxable: 70 - 10 (fees not taxable)
        assert_eq!(calc.taxable_amount, dec!(60));
        assert_eq!(calc.tax, dec!(6));
    }

    #[test]
    fn clamps_at_zero() {
        let mut input = line(dec!(50), dec!(1));
        input.insurance_amount = dec!(80);
        let calc = calculate_line(&input, &ten_percent()).unwrap();
        assert_eq!(calc.total_amount, Decimal::ZERO);
        assert_eq!(calc.tax, Decimal::ZERO);
    }

    #[test]
    fn non_taxable_service_has_no_tax() {
        let mut input = line(dec!(100), dec!(1));
        input.service_taxable = false;
        let calc = calculate_line(&input, &ten_percent()).unwrap();
        assert_eq!(calc.tax, Decimal::ZERO);
    }

    #[test]
    fn rejects_zero_quantity() {
        assert!(calculate_line(&line(dec!(100), dec!(0)), &ten_percent()).is_err());
    }
}
