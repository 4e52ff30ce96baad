//! Exact decimal money type.
//!
//! Every monetary and percentage value in the system is a decimal with
//! exactly 4 fractional digits. `rust_decimal::Decimal` already
//! carries an exact base-10 mantissa/scale, so `Money` is a thin newtype
//! that pins the scale to 4 on every construction and arithmetic result,
//! the way a ledger would round a running balance at each posting rather
//! than let scale drift.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const SCALE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        let mut v = value.round_dp(SCALE);
        v.rescale(SCALE);
        Money(v)
    }

    pub fn from_i64(units: i64) -> Self {
        Money::new(Decimal::from(units))
    }

    pub fn zero() -> Self {
        Money::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Clamp negative amounts to zero. Used wherever a monetary
    /// component must never go negative.
    pub fn non_negative(self) -> Self {
        if self.is_negative() {
            Money::ZERO
        } else {
            self
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn checked_div(&self, divisor: Decimal) -> Option<Money> {
        if divisor.is_zero() {
            return None;
        }
        Some(Money::new(self.0 / divisor))
    }

    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Money) -> Money {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl From<Money> for String {
    fn from(m: Money) -> Self {
        m.to_string()
    }
}

impl TryFrom<String> for Money {
    type Error = rust_decimal::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Decimal::from_str(&s).map(Money::new)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

/// Multiply a money amount by a plain decimal factor (unit price, rate,
/// quantity), rounding the result to 4 places. Rounding happens once per
/// call, never across an accumulated sum.
pub fn mul(amount: Money, factor: Decimal) -> Money {
    Money::new(amount.as_decimal() * factor)
}

/// Round a raw decimal per a `BillableMetric.rounding_function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingFunction {
    Round,
    Ceil,
    Floor,
}

impl RoundingFunction {
    pub fn apply(&self, value: Decimal, precision: u32) -> Decimal {
        match self {
            RoundingFunction::Round => value.round_dp(precision),
            RoundingFunction::Ceil => {
                let scale = Decimal::from(10u64.pow(precision));
                (value * scale).ceil() / scale
            }
            RoundingFunction::Floor => {
                let scale = Decimal::from(10u64.pow(precision));
                (value * scale).floor() / scale
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pins_scale_to_four() {
        let m = Money::new(dec!(10));
        assert_eq!(m.to_string(), "10.0000");
    }

    #[test]
    fn non_negative_clamps() {
        let m = Money::new(dec!(-5.5));
        assert_eq!(m.non_negative(), Money::ZERO);
    }

    #[test]
    fn round_trips_through_string() {
        let m = Money::new(dec!(19.99));
        let s: String = m.into();
        let back: Money = s.try_into().expect("valid decimal string");
        assert_eq!(back, m);
    }

    #[test]
    fn rounding_function_ceil() {
        let r = RoundingFunction::Ceil.apply(dec!(2.001), 2);
        assert_eq!(r, dec!(2.01));
    }

    #[test]
    fn rounding_function_floor() {
        let r = RoundingFunction::Floor.apply(dec!(2.999), 2);
        assert_eq!(r, dec!(2.99));
    }
}
