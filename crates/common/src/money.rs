//! Money amounts held as integer cents.

use serde::{Deserialize, Serialize};

/// One percent expressed in basis points.
pub const BASIS_POINTS_PER_PERCENT: u32 = 100;

const BASIS_POINTS_SCALE: i128 = 10_000;

/// Money amount represented in cents to avoid floating point issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money {
    /// Amount in cents (e.g., 1000 = $10.00)
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Creates a new Money amount from a whole dollar value.
    pub fn from_dollars(dollars: i64) -> Self {
        Self {
            cents: dollars * 100,
        }
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self { cents: 0 }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the dollar portion (whole number).
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.cents.abs() % 100
    }

    /// Returns the amount as fractional dollars, for metric values only.
    pub fn as_dollars_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.cents == 0
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Multiplies by a quantity.
    pub fn multiply(&self, quantity: u32) -> Money {
        Money {
            cents: self.cents * i64::from(quantity),
        }
    }

    /// Returns the given share of this amount, rounded half-up to the cent.
    ///
    /// The share is in basis points, so `percent_bp(1_000)` is 10 %.
    /// Halves round away from zero.
    pub fn percent_bp(&self, basis_points: u32) -> Money {
        let scaled = i128::from(self.cents) * i128::from(basis_points);
        let mut quotient = scaled / BASIS_POINTS_SCALE;
        let remainder = scaled % BASIS_POINTS_SCALE;
        if remainder.abs() * 2 >= BASIS_POINTS_SCALE {
            quotient += scaled.signum();
        }
        Money {
            cents: quotient as i64,
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}.{:02}", self.dollars().abs(), self.cents_part())
        } else {
            write!(f, "${}.{:02}", self.dollars(), self.cents_part())
        }
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents + rhs.cents,
        }
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents - rhs.cents,
        }
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.cents += rhs.cents;
    }
}

impl std::ops::SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.cents -= rhs.cents;
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_from_cents() {
        let money = Money::from_cents(1234);
        assert_eq!(money.cents(), 1234);
        assert_eq!(money.dollars(), 12);
        assert_eq!(money.cents_part(), 34);
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(1234).to_string(), "$12.34");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-1234).to_string(), "-$12.34");
    }

    #[test]
    fn test_money_arithmetic() {
        let a = Money::from_cents(1000);
        let b = Money::from_cents(500);

        assert_eq!((a + b).cents(), 1500);
        assert_eq!((a - b).cents(), 500);
        assert_eq!(a.multiply(3).cents(), 3000);
    }

    #[test]
    fn test_money_sum() {
        let total: Money = [100, 250, 3]
            .into_iter()
            .map(Money::from_cents)
            .sum();
        assert_eq!(total.cents(), 353);
    }

    #[test]
    fn percent_of_whole_amount() {
        assert_eq!(Money::from_dollars(100).percent_bp(2_000), Money::from_dollars(20));
        assert_eq!(Money::from_dollars(85).percent_bp(1_000).cents(), 850);
    }

    #[test]
    fn percent_rounds_half_up() {
        // 10% of $0.05 is half a cent
        assert_eq!(Money::from_cents(5).percent_bp(1_000).cents(), 1);
        // 10% of $0.04 is 0.4 cents
        assert_eq!(Money::from_cents(4).percent_bp(1_000).cents(), 0);
        // 15% of $33.33 = 4.9995
        assert_eq!(Money::from_cents(3333).percent_bp(1_500).cents(), 500);
        // 12.5% of $0.12 = 1.5 cents
        assert_eq!(Money::from_cents(12).percent_bp(1_250).cents(), 2);
    }

    #[test]
    fn percent_rounds_negative_halves_away_from_zero() {
        assert_eq!(Money::from_cents(-5).percent_bp(1_000).cents(), -1);
    }

    #[test]
    fn test_money_serializes_as_cents() {
        let json = serde_json::to_string(&Money::from_cents(999)).unwrap();
        assert_eq!(json, "999");
    }
}
