//! Monetary helpers
//!
//! Amounts are `rust_decimal::Decimal` and are rounded half-up to cents at every persisted
//! boundary. Currency travels alongside as an ISO-4217 code.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Round half-up (away from zero) to two decimal places.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `value` percent of `base`, unrounded.
pub fn percent_of(base: Decimal, value: Decimal) -> Decimal {
    base * value / Decimal::ONE_HUNDRED
}

pub fn clamp_non_negative(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount: round2(amount),
            currency: currency.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(dec!(1.005)), dec!(1.01));
        assert_eq!(round2(dec!(1.004)), dec!(1.00));
        assert_eq!(round2(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn percent_of_base() {
        assert_eq!(percent_of(dec!(200), dec!(10)), dec!(20));
    }

    #[test]
    fn money_rounds_on_construction() {
        assert_eq!(Money::new(dec!(33.333), "USD").amount, dec!(33.33));
    }
}
