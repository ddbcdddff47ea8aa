use crate::error::{Result, SettlementError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currencies the ledger accepts. There is no conversion between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    /// Number of minor units in one major unit.
    pub fn exponent(&self) -> u32 {
        2
    }

    pub fn all() -> [Currency; 3] {
        [Currency::Usd, Currency::Eur, Currency::Gbp]
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            other => Err(SettlementError::ValidationError(format!(
                "Unsupported currency: {other}"
            ))),
        }
    }
}

/// A strictly positive amount in minor currency units (cents).
///
/// Requests carry `MinorUnits`; the signed ledger amount is derived from the
/// entry type so callers never pass a sign by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinorUnits(i64);

impl MinorUnits {
    pub fn new(value: i64) -> Result<Self> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(SettlementError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    /// Converts a major-unit decimal (e.g. `20.50`) into minor units.
    /// Fractions of a minor unit are rejected rather than rounded.
    pub fn from_major(value: Decimal, currency: Currency) -> Result<Self> {
        let scaled = value * Decimal::from(10_i64.pow(currency.exponent()));
        if scaled.fract() != Decimal::ZERO {
            return Err(SettlementError::ValidationError(format!(
                "Amount {value} is not a whole number of {currency} minor units"
            )));
        }
        let cents = i64::try_from(scaled).map_err(|_| {
            SettlementError::ValidationError(format!("Amount {value} is out of range"))
        })?;
        Self::new(cents)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for MinorUnits {
    type Error = SettlementError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MinorUnits> for i64 {
    fn from(amount: MinorUnits) -> Self {
        amount.0
    }
}

/// Renders a signed minor-unit amount as a major-unit decimal for reports.
pub fn to_major(amount: i64, currency: Currency) -> Decimal {
    Decimal::new(amount, currency.exponent()).normalize()
}
