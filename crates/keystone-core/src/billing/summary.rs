use rust_decimal::Decimal;

use super::bill::BillTotals;
use super::breakdown::LineCalculation;
use super::plan::PlanFigures;
use crate::models::RuleKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub title: String,
    pub amount: Decimal,
}

fn row(title: &str, amount: Decimal) -> SummaryRow {
    SummaryRow {
        title: title.to_string(),
        amount,
    }
}

/// Summary rows for a bill: one per category (gross line charges, first-seen order), then
/// the fixed rows. Reductions are negative.
pub fn build_summary(
    lines: &[(String, LineCalculation)],
    totals: &BillTotals,
    plan: Option<&PlanFigures>,
) -> Vec<SummaryRow> {
    let mut rows: Vec<SummaryRow> = Vec::new();
    for (category, calc) in lines {
        match rows.iter_mut().find(|r| &r.title == category) {
            Some(existing) => existing.amount += calc.sub_total,
            None => rows.push(row(category, calc.sub_total)),
        }
    }

    let line_sum = |kind: RuleKind| -> Decimal { lines.iter().map(|(_, l)| l.sum_of(kind)).sum() };
    let bill_sum = |kind: RuleKind| -> Decimal {
        totals
            .applied
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.amount)
            .sum()
    };

    let other_fees: Decimal = lines.iter().map(|(_, l)| l.other_fees).sum();
    rows.push(row("Other Fees", other_fees));
    rows.push(row(
        "Adjustment",
        line_sum(RuleKind::Adjustment) + bill_sum(RuleKind::Adjustment),
    ));
    rows.push(row(
        "Discount",
        line_sum(RuleKind::Discount) + bill_sum(RuleKind::Discount),
    ));
    rows.push(row(
        "Write-Off",
        line_sum(RuleKind::WriteOff) + bill_sum(RuleKind::WriteOff),
    ));
    rows.push(row("Insurance", -totals.insurance_paid));
    rows.push(row("Tax", totals.other_tax));

    if let Some(plan) = plan {
        rows.push(row("Payment Plan Fees", plan.fees));
        rows.push(row("Interest Amount", plan.interest_amount));
        rows.push(row("Payment Plan Tax", plan.tax()));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{calculate_bill, calculate_line, TaxRule};
    use crate::models::{BreakdownInput, RuleSpec, RuleType};
    use rust_decimal_macros::dec;

    fn input(category: &str, unit: Decimal) -> BreakdownInput {
        BreakdownInput {
            category: category.to_string(),
            type_of_service: "svc".to_string(),
            description: None,
            unit_amount: unit,
            service_taxable: true,
            quantity: dec!(1),
            insurance_amount: dec!(5),
            other_fees: dec!(2),
            other_fees_taxable: true,
            adjustments: vec![],
            discounts: vec![],
            writeoffs: vec![],
            currency: None,
            service_start_date: None,
            service_end_date: None,
        }
    }

    #[test]
    fn rows_reconcile_with_patient_amount() {
        let tax = TaxRule {
            tax_type: RuleType::Percent,
            value: dec!(10),
            max_upto: None,
        };
        let lines: Vec<(String, LineCalculation)> = [("Parking", dec!(50)), ("Storage", dec!(30)), ("Parking", dec!(20))]
            .iter()
            .map(|(c, u)| (c.to_string(), calculate_line(&input(c, *u), &tax).unwrap()))
            .collect();
        let calcs: Vec<LineCalculation> = lines.iter().map(|(_, l)| l.clone()).collect();
        let discount = RuleSpec {
            name: "d".to_string(),
            rule_type: RuleType::Flat,
            value: dec!(10),
            max_upto: None,
            taxable: true,
            direction: None,
        };
        let totals = calculate_bill(&calcs, &[], &[discount], &[], &tax);

        let rows = build_summary(&lines, &totals, None);

        assert_eq!(rows[0], row("Parking", dec!(70)));
        assert_eq!(rows[1], row("Storage", dec!(30)));
        let sum: Decimal = rows.iter().map(|r| r.amount).sum();
        assert_eq!(sum, totals.patient_amount);
    }
}
