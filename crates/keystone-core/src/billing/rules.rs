use rust_decimal::Decimal;

use crate::money::{percent_of, round2};
use crate::models::{AdjustmentDirection, RuleKind, RuleSpec, RuleType};

/// Magnitude of a rule over `base`: PERCENT capped by `max_upto`, FLAT capped by the base.
pub fn rule_amount(spec: &RuleSpec, base: Decimal) -> Decimal {
    let base = base.max(Decimal::ZERO);
    let raw = match spec.rule_type {
        RuleType::Percent => {
            let v = percent_of(base, spec.value);
            match spec.max_upto {
                Some(cap) => v.min(cap),
                None => v,
            }
        }
        RuleType::Flat => spec.value.min(base),
    };
    round2(raw.max(Decimal::ZERO))
}

/// Effect on the running total: adjustments follow their direction, the rest subtract.
pub fn signed_amount(kind: RuleKind, spec: &RuleSpec, base: Decimal) -> Decimal {
    let amount = rule_amount(spec, base);
    match (kind, spec.direction) {
        (RuleKind::Adjustment, Some(AdjustmentDirection::Neg)) => -amount,
        (RuleKind::Adjustment, _) => amount,
        (RuleKind::Discount | RuleKind::WriteOff, _) => -amount,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAmount {
    pub kind: RuleKind,
    pub spec: RuleSpec,
    /// Signed effect on the total.
    pub amount: Decimal,
}

/// Running total plus the taxable base it carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ledger {
    pub total: Decimal,
    pub taxable: Decimal,
    pub applied: Vec<AppliedAmount>,
}

impl Ledger {
    pub fn new(total: Decimal, taxable: Decimal) -> Self {
        Self {
            total,
            taxable,
            applied: Vec::new(),
        }
    }

    /// Apply a group of rules computed over `base`; skipped once the total reaches zero.
    pub fn apply_group(&mut self, kind: RuleKind, specs: &[RuleSpec], base: Decimal) {
        if self.total <= Decimal::ZERO {
            return;
        }
        for spec in specs {
            let amount = signed_amount(kind, spec, base);
            self.total += amount;
            if spec.taxable {
                self.taxable += amount;
            }
            self.applied.push(AppliedAmount {
                kind,
                spec: spec.clone(),
                amount,
            });
        }
    }

    pub fn clamp(&mut self) {
        self.total = self.total.max(Decimal::ZERO);
        self.taxable = self.taxable.max(Decimal::ZERO);
    }

    /// Sum of signed amounts of one kind.
    pub fn sum_of(&self, kind: RuleKind) -> Decimal {
        self.applied
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec(rule_type: RuleType, value: Decimal, max_upto: Option<Decimal>) -> RuleSpec {
        RuleSpec {
            name: "r".to_string(),
            rule_type,
            value,
            max_upto,
            taxable: true,
            direction: None,
        }
    }

    #[test]
    fn percent_is_capped() {
        assert_eq!(rule_amount(&spec(RuleType::Percent, dec!(10), None), dec!(200)), dec!(20));
        assert_eq!(
            rule_amount(&spec(RuleType::Percent, dec!(10), Some(dec!(15))), dec!(200)),
            dec!(15)
        );
    }

    #[test]
    fn flat_never_exceeds_base() {
        assert_eq!(rule_amount(&spec(RuleType::Flat, dec!(50), None), dec!(30)), dec!(30));
    }

    #[test]
    fn adjustment_direction() {
        let mut s = spec(RuleType::Flat, dec!(5), None);
        assert_eq!(signed_amount(RuleKind::Adjustment, &s, dec!(100)), dec!(5));
        s.direction = Some(AdjustmentDirection::Neg);
        assert_eq!(signed_amount(RuleKind::Adjustment, &s, dec!(100)), dec!(-5));
        assert_eq!(signed_amount(RuleKind::Discount, &s, dec!(100)), dec!(-5));
    }

    #[test]
    fn non_taxable_rule_leaves_taxable_base() {
        let mut ledger = Ledger::new(dec!(100), dec!(100));
        let mut s = spec(RuleType::Flat, dec!(10), None);
        s.taxable = false;
        ledger.apply_group(RuleKind::Discount, &[s], dec!(100));
        assert_eq!(ledger.total, dec!(90));
        assert_eq!(ledger.taxable, dec!(100));
    }

    #[test]
    fn group_skipped_at_zero() {
        let mut ledger = Ledger::new(Decimal::ZERO, Decimal::ZERO);
        ledger.apply_group(
            RuleKind::Discount,
            &[spec(RuleType::Flat, dec!(10), None)],
            dec!(100),
        );
        assert!(ledger.applied.is_empty());
    }
}
