//! Monetary types for the card ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IssuerError, Result};

/// Number of fractional digits stored for every money column.
pub const MONEY_SCALE: u32 = 2;

/// Total number of digits stored for every money column (`NUMERIC(9, 2)`).
pub const MONEY_PRECISION: u32 = 9;

/// Largest amount a single money column can hold.
pub fn max_amount() -> Decimal {
    Decimal::new(10i64.pow(MONEY_PRECISION) - 1, MONEY_SCALE)
}

/// Normalize an amount to the ledger scale (2 decimal places).
pub fn to_ledger_scale(value: Decimal) -> Decimal {
    let mut value = value.round_dp(MONEY_SCALE);
    value.rescale(MONEY_SCALE);
    value
}

/// Check a boundary amount: strictly positive, at most two fractional digits
/// and representable in a `NUMERIC(9, 2)` column.
///
/// Returns the amount rescaled to exactly two decimal places.
pub fn validate_amount(field: &str, value: Decimal) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(IssuerError::invalid_input(field, "must be greater than zero"));
    }
    if value.normalize().scale() > MONEY_SCALE {
        return Err(IssuerError::invalid_input(
            field,
            format!("must have at most {} decimal places", MONEY_SCALE),
        ));
    }
    if value > max_amount() {
        return Err(IssuerError::invalid_input(
            field,
            format!("must not exceed {}", max_amount()),
        ));
    }
    Ok(to_ledger_scale(value))
}

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount value.
    pub value: Decimal,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a currency from a trusted code. The code is uppercased, so
    /// `Currency::new("brl") == Currency::brl()`. Use [`Currency::parse`] for
    /// codes received from callers.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Whether `code` has the shape of an ISO 4217 code: three uppercase
    /// ASCII letters.
    pub fn is_iso_code(code: &str) -> bool {
        code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
    }

    /// Parse a caller supplied code without normalizing it. Anything other
    /// than three uppercase ASCII letters is an [`IssuerError::InvalidCurrency`].
    pub fn parse(code: &str) -> Result<Self> {
        if Self::is_iso_code(code) {
            Ok(Self(code.to_string()))
        } else {
            Err(IssuerError::InvalidCurrency(code.to_string()))
        }
    }

    pub fn brl() -> Self {
        Self::new("BRL")
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn gbp() -> Self {
        Self::new("GBP")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
