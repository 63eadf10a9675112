use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::constants::DEFAULT_TAX_PERCENT;
use crate::money::{percent_of, round2};
use crate::models::{RuleType, TaxPerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxRule {
    pub tax_type: RuleType,
    pub value: Decimal,
    pub max_upto: Option<Decimal>,
}

impl Default for TaxRule {
    fn default() -> Self {
        Self {
            tax_type: RuleType::Percent,
            value: Decimal::from(DEFAULT_TAX_PERCENT),
            max_upto: None,
        }
    }
}

impl TaxRule {
    /// Active rule for `state` whose window contains `on`; 5% percent when none applies.
    pub fn for_state(rules: &[TaxPerState], state: Option<&str>, on: NaiveDate) -> TaxRule {
        let Some(state) = state else {
            return TaxRule::default();
        };
        rules
            .iter()
            .filter(|r| r.active && !r.audit.is_deleted() && r.state.eq_ignore_ascii_case(state))
            .filter(|r| r.start_date.map_or(true, |s| s <= on) && r.end_date.map_or(true, |e| on <= e))
            .max_by_key(|r| r.start_date)
            .map(|r| TaxRule {
                tax_type: r.tax_type,
                value: r.value,
                max_upto: r.max_upto,
            })
            .unwrap_or_default()
    }

    /// Line-level tax.
    pub fn apply(&self, taxable: Decimal) -> Decimal {
        if taxable <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let raw = match self.tax_type {
            RuleType::Percent => percent_of(taxable, self.value),
            RuleType::Flat => self.value,
        };
        let capped = match self.max_upto {
            Some(cap) => raw.min(cap),
            None => raw,
        };
        round2(capped.max(Decimal::ZERO))
    }

    /// Bill-level tax. A flat tax was already charged per line, so it contributes nothing here.
    pub fn apply_secondary(&self, taxable: Decimal) -> Decimal {
        match self.tax_type {
            RuleType::Flat => Decimal::ZERO,
            RuleType::Percent => self.apply(taxable),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.tax_type == RuleType::Flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::AuditEnvelope;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn rule(state: &str, value: Decimal, start: Option<NaiveDate>) -> TaxPerState {
        TaxPerState {
            audit: AuditEnvelope::stamp_create(&RequestContext::system(Uuid::new_v4())),
            state: state.to_string(),
            tax_type: RuleType::Percent,
            value,
            max_upto: None,
            active: true,
            start_date: start,
            end_date: None,
        }
    }

    #[test]
    fn unknown_state_falls_back_to_five_percent() {
        let on = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let tax = TaxRule::for_state(&[rule("CA", dec!(10), None)], Some("NV"), on);
        assert_eq!(tax.apply(dec!(100)), dec!(5));
    }

    #[test]
    fn picks_rule_effective_on_date() {
        let on = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let rules = vec![
            rule("CA", dec!(8), NaiveDate::from_ymd_opt(2024, 1, 1)),
            rule("CA", dec!(10), NaiveDate::from_ymd_opt(2025, 1, 1)),
            rule("CA", dec!(12), NaiveDate::from_ymd_opt(2026, 1, 1)),
        ];
        assert_eq!(TaxRule::for_state(&rules, Some("ca"), on).value, dec!(10));
    }

    #[test]
    fn flat_secondary_is_zero() {
        let tax = TaxRule {
            tax_type: RuleType::Flat,
            value: dec!(3),
            max_upto: None,
        };
        assert_eq!(tax.apply(dec!(100)), dec!(3));
        assert_eq!(tax.apply_secondary(dec!(100)), Decimal::ZERO);
    }
}
