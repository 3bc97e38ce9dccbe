use serde::{Serialize, Serializer};
use std::fmt;
use std::iter::Sum;

/// Fixed-point decimal with 4 decimal places, stored as a scaled integer.
///
/// One ledger unit equals one coin, and one USD converts to one coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 10_000;

    pub const ZERO: Amount = Amount(0);

    pub fn from_float(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Whole units, e.g. `Amount::from_units(25)` is 25.0000.
    pub fn from_units(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// `None` if the sum does not fit.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

// JSON clients expect a plain number for balances and amounts
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}
