//! The rate value type.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A non-negative fractional rate, e.g. `0.10` for 10%.
///
/// Backed by an exact decimal; scale is preserved, so `0.10` stays `0.10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct RateValue(Decimal);

impl RateValue {
    pub fn new(value: Decimal) -> Result<Self, ValidationError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(ValidationError::NegativeRate {
                value: value.to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Parse an exact decimal, accepting plain (`0.12`) and scientific
    /// (`1.2e-1`) notation.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let decimal = Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map_err(|_| ValidationError::InvalidDecimal {
                value: input.to_string(),
            })?;
        Self::new(decimal)
    }

    /// Convert a float through its shortest round-trip decimal text.
    ///
    /// `0.15_f64` becomes exactly `0.15`, never `0.1499999999999999944…`.
    pub fn from_f64_text(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteRate);
        }
        Self::parse(&value.to_string())
    }

    pub const fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub const fn scale(&self) -> u32 {
        self.0.scale()
    }
}

impl TryFrom<Decimal> for RateValue {
    type Error = ValidationError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RateValue> for Decimal {
    fn from(value: RateValue) -> Self {
        value.0
    }
}

impl FromStr for RateValue {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for RateValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}
