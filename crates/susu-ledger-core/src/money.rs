use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
    str::FromStr,
};

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fractional digits carried by currency amounts.
pub const CURRENCY_SCALE: u32 = 2;

/// Fractional digits used when reporting share ratios.
pub const RATIO_SCALE: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("{value} has more than {max_scale} fractional digits")]
    Precision { value: Decimal, max_scale: u32 },
    #[error("allocation weight {0} is negative")]
    NegativeWeight(Decimal),
    #[error("allocation needs at least one weight")]
    NoWeights,
    #[error("allocation weights sum to zero")]
    ZeroTotalWeight,
    #[error("invalid amount: {0}")]
    Parse(String),
    #[error("amount out of range")]
    Overflow,
}

/// Rounds half to even ("banker's rounding") at `dp` fractional digits.
pub fn bankers_round(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven)
}

/// An exact currency amount with two fractional digits.
///
/// Values may be negative (balances are signed); callers that need a strictly
/// positive amount check `is_positive` themselves. All rounding into the
/// currency scale goes through [`bankers_round`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Wraps `value`, refusing anything with more than two significant
    /// fractional digits.
    pub fn new(value: Decimal) -> Result<Self, MoneyError> {
        if value.normalize().scale() > CURRENCY_SCALE {
            return Err(MoneyError::Precision {
                value,
                max_scale: CURRENCY_SCALE,
            });
        }
        let mut value = value;
        value.rescale(CURRENCY_SCALE);
        Ok(Money(value))
    }

    /// Rounds an arbitrary-precision value into the currency scale.
    pub fn rounded(value: Decimal) -> Self {
        let mut value = bankers_round(value, CURRENCY_SCALE);
        value.rescale(CURRENCY_SCALE);
        Money(value)
    }

    /// Builds an amount from a count of smallest currency units (cents).
    pub fn from_minor(units: i64) -> Self {
        Money(Decimal::new(units, CURRENCY_SCALE))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Money {
        Money(self.0.abs())
    }

    pub fn checked_add(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0.checked_add(rhs.0).map(Money).ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0.checked_sub(rhs.0).map(Money).ok_or(MoneyError::Overflow)
    }

    /// Multiplies by an arbitrary scalar and rounds the product back to the
    /// currency scale.
    pub fn multiply(self, scalar: Decimal) -> Result<Money, MoneyError> {
        self.0
            .checked_mul(scalar)
            .map(Money::rounded)
            .ok_or(MoneyError::Overflow)
    }

    /// Splits `self` proportionally to `weights` so that the parts sum to
    /// exactly `self`.
    ///
    /// Largest remainder: each exact share is truncated to whole cents and the
    /// cents left over go one at a time to the largest truncated fractions,
    /// the earlier entry winning a tie. Every part is within one cent of its
    /// exact share and carries the sign of `self`. Entries with a zero weight
    /// always receive zero.
    pub fn allocate(self, weights: &[Decimal]) -> Result<Vec<Money>, MoneyError> {
        if weights.is_empty() {
            return Err(MoneyError::NoWeights);
        }
        if let Some(w) = weights.iter().find(|w| **w < Decimal::ZERO) {
            return Err(MoneyError::NegativeWeight(*w));
        }

        let total_weight = weights
            .iter()
            .try_fold(Decimal::ZERO, |acc, w| acc.checked_add(*w))
            .ok_or(MoneyError::Overflow)?;
        if total_weight.is_zero() {
            return Err(MoneyError::ZeroTotalWeight);
        }

        let units = self
            .0
            .abs()
            .checked_mul(Decimal::ONE_HUNDRED)
            .ok_or(MoneyError::Overflow)?;

        let mut cents = Vec::with_capacity(weights.len());
        let mut fractions = Vec::with_capacity(weights.len());
        let mut assigned = Decimal::ZERO;
        for (i, weight) in weights.iter().enumerate() {
            if weight.is_zero() {
                cents.push(Decimal::ZERO);
                continue;
            }
            let exact = proportion(units, *weight, total_weight)?;
            let whole = exact.trunc();
            assigned += whole;
            fractions.push((i, exact - whole));
            cents.push(whole);
        }

        let leftover = (units - assigned).to_usize().ok_or(MoneyError::Overflow)?;
        fractions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (i, _) in fractions.iter().cycle().take(leftover) {
            cents[*i] += Decimal::ONE;
        }

        let negative = self.is_negative();
        Ok(cents
            .into_iter()
            .map(|c| {
                let part = Money::rounded(c / Decimal::ONE_HUNDRED);
                if negative {
                    -part
                } else {
                    part
                }
            })
            .collect())
    }
}

fn proportion(total: Decimal, weight: Decimal, total_weight: Decimal) -> Result<Decimal, MoneyError> {
    total
        .checked_mul(weight)
        .and_then(|product| product.checked_div(total_weight))
        .or_else(|| weight.checked_div(total_weight).and_then(|ratio| total.checked_mul(ratio)))
        .ok_or(MoneyError::Overflow)
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|e| MoneyError::Parse(format!("{}: {}", s, e)))?;
        Money::new(value)
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn test_bankers_round_half_to_even() {
        assert_eq!(bankers_round(dec!(0.5), 0), dec!(0));
        assert_eq!(bankers_round(dec!(2.5), 0), dec!(2));
        assert_eq!(bankers_round(dec!(1.5), 0), dec!(2));
        assert_eq!(bankers_round(dec!(3.5), 0), dec!(4));
        assert_eq!(bankers_round(dec!(-1.5), 0), dec!(-2));
        assert_eq!(bankers_round(dec!(-2.5), 0), dec!(-2));
    }

    #[test]
    fn test_bankers_round_two_places() {
        assert_eq!(bankers_round(dec!(1.234), 2), dec!(1.23));
        assert_eq!(bankers_round(dec!(1.235), 2), dec!(1.24));
        assert_eq!(bankers_round(dec!(1.225), 2), dec!(1.22));
        assert_eq!(bankers_round(dec!(1.245), 2), dec!(1.24));
        assert_eq!(bankers_round(dec!(123.456789), 4), dec!(123.4568));
    }

    #[test]
    fn test_new_rejects_excess_precision() {
        assert!(matches!(
            Money::new(dec!(1.234)),
            Err(MoneyError::Precision { .. })
        ));
        // Trailing zeros are not significant.
        assert_eq!(Money::new(dec!(1.2300)).unwrap(), money("1.23"));
        assert_eq!(Money::new(dec!(7)).unwrap().to_string(), "7.00");
    }

    #[test]
    fn test_multiply_rounds_half_even() {
        assert_eq!(money("10.00").multiply(dec!(0.1225)).unwrap(), money("1.22"));
        assert_eq!(money("10.00").multiply(dec!(0.1235)).unwrap(), money("1.24"));
    }

    #[test]
    fn test_checked_arithmetic_reports_overflow() {
        let huge = Money(Decimal::MAX);
        assert_eq!(huge.checked_add(money("1.00")), Err(MoneyError::Overflow));
        assert_eq!((-huge).checked_sub(money("1.00")), Err(MoneyError::Overflow));
        assert_eq!(huge.multiply(dec!(2)), Err(MoneyError::Overflow));
        assert_eq!(money("1.00").checked_add(money("2.50")).unwrap(), money("3.50"));
    }

    #[test]
    fn test_allocate_time_weighted_example() {
        let parts = money("3.00").allocate(&[dec!(3000), dec!(2000)]).unwrap();
        assert_eq!(parts, vec![money("1.80"), money("1.20")]);
    }

    #[test]
    fn test_allocate_leftover_cents_go_to_largest_fractions() {
        let parts = money("100.00")
            .allocate(&[dec!(1), dec!(1), dec!(1)])
            .unwrap();
        assert_eq!(parts, vec![money("33.34"), money("33.33"), money("33.33")]);

        let parts = money("0.01")
            .allocate(&[dec!(1), dec!(1), dec!(1), dec!(0)])
            .unwrap();
        assert_eq!(parts, vec![money("0.01"), Money::ZERO, Money::ZERO, Money::ZERO]);

        // 1.00 over 1:2:3 is 0.1666.., 0.3333.., 0.50: the largest fraction wins.
        let parts = money("1.00").allocate(&[dec!(1), dec!(2), dec!(3)]).unwrap();
        assert_eq!(parts, vec![money("0.17"), money("0.33"), money("0.50")]);
    }

    #[test]
    fn test_allocate_many_equal_weights_small_total() {
        let parts = money("0.15").allocate(&[dec!(1); 10]).unwrap();
        assert_eq!(parts.iter().sum::<Money>(), money("0.15"));
        assert_eq!(parts.iter().filter(|p| **p == money("0.02")).count(), 5);
        assert_eq!(parts.iter().filter(|p| **p == money("0.01")).count(), 5);
        assert_eq!(&parts[..5], &[money("0.02"); 5]);
    }

    #[test]
    fn test_allocate_sums_exactly_for_many_shapes() {
        let totals = ["0.01", "0.15", "1.00", "3.00", "99.99", "1234567.89", "-10.00", "-0.07"];
        let shapes: Vec<Box<dyn Fn(u32) -> Decimal>> = vec![
            Box::new(|i| Decimal::from(i * i) / dec!(7)),
            Box::new(|_| Decimal::ONE),
            Box::new(|i| Decimal::from(100 - i)),
            Box::new(|i| if i % 3 == 0 { Decimal::ZERO } else { Decimal::from(i) / dec!(3) }),
            Box::new(|i| if i == 1 { dec!(1000000) } else { dec!(0.001) }),
        ];
        for total in totals {
            let total = money(total);
            for (s, shape) in shapes.iter().enumerate() {
                for n in 1..=40u32 {
                    let weights: Vec<Decimal> = (1..=n).map(|i| shape(i)).collect();
                    if weights.iter().all(|w| w.is_zero()) {
                        continue;
                    }
                    let total_weight: Decimal = weights.iter().sum();
                    let parts = total.allocate(&weights).unwrap();
                    assert_eq!(parts.len(), weights.len());
                    assert_eq!(parts.iter().sum::<Money>(), total, "total {} shape {} over {} weights", total, s, n);
                    for (part, weight) in parts.iter().zip(&weights) {
                        assert!(
                            !part.is_negative() || total.is_negative(),
                            "negative part {} of {} shape {} n {}", part, total, s, n
                        );
                        assert!(!part.is_positive() || !total.is_negative());
                        let exact = total.amount() * *weight / total_weight;
                        assert!((part.amount() - exact).abs() < dec!(0.01), "part {} vs exact {}", part, exact);
                        if weight.is_zero() {
                            assert!(part.is_zero());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_allocate_single_non_zero_weight_takes_everything() {
        let parts = money("5.55")
            .allocate(&[dec!(0), dec!(0), dec!(42), dec!(0)])
            .unwrap();
        assert_eq!(parts, vec![Money::ZERO, Money::ZERO, money("5.55"), Money::ZERO]);
    }

    #[test]
    fn test_allocate_rejects_bad_weights() {
        assert_eq!(money("1.00").allocate(&[]), Err(MoneyError::NoWeights));
        assert_eq!(
            money("1.00").allocate(&[dec!(0), dec!(0)]),
            Err(MoneyError::ZeroTotalWeight)
        );
        assert_eq!(
            money("1.00").allocate(&[dec!(1), dec!(-1)]),
            Err(MoneyError::NegativeWeight(dec!(-1)))
        );
    }

    #[test]
    fn test_display_and_parse() {
        assert_eq!(Money::ZERO.to_string(), "0.00");
        assert_eq!(Money::from_minor(-150).to_string(), "-1.50");
        assert!("abc".parse::<Money>().is_err());
    }
}
