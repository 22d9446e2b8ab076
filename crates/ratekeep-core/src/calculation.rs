//! Applying the resolved rate to a sum.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::info;

use crate::error::{RateError, ValidationError};
use crate::resolver::Resolver;
use crate::value::RateValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Calculation {
    pub number1: Decimal,
    pub number2: Decimal,
    pub rate: RateValue,
    /// `(number1 + number2) * (1 + rate)`, two decimal places, half-up.
    pub result: Decimal,
}

/// `(a + b) + (a + b) * rate`, rounded half-up to exactly two decimals.
///
/// Fails with [`ValidationError::Overflow`] when any step leaves the
/// decimal range.
pub fn apply_rate(a: Decimal, b: Decimal, rate: RateValue) -> Result<Decimal, ValidationError> {
    let sum = a
        .checked_add(b)
        .ok_or(ValidationError::Overflow { operation: "number1 + number2" })?;
    let increase = sum
        .checked_mul(rate.as_decimal())
        .ok_or(ValidationError::Overflow { operation: "sum * rate" })?;
    let mut result = sum
        .checked_add(increase)
        .ok_or(ValidationError::Overflow { operation: "sum + increase" })?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    result.rescale(2);
    Ok(result)
}

pub struct Calculator {
    resolver: Arc<Resolver>,
}

impl Calculator {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    /// Resolve the current rate and apply it to `a + b`.
    pub async fn calculate(&self, a: Decimal, b: Decimal) -> Result<Calculation, RateError> {
        let rate = self.resolver.resolve().await?;
        let result = apply_rate(a, b, rate)?;
        info!(number1 = %a, number2 = %b, %rate, %result, "calculation completed");
        Ok(Calculation {
            number1: a,
            number2: b,
            rate,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(value: Decimal) -> RateValue {
        RateValue::new(value).expect("rate")
    }

    fn apply(a: Decimal, b: Decimal, r: Decimal) -> Decimal {
        apply_rate(a, b, rate(r)).expect("in range")
    }

    #[test]
    fn applies_rate_to_sum() {
        assert_eq!(apply(dec!(5), dec!(5), dec!(0.10)), dec!(11.00));
        assert_eq!(apply(dec!(5), dec!(5), dec!(0.10)).to_string(), "11.00");
    }

    #[test]
    fn rounds_half_up() {
        // 0.125 * 1 = 0.125 -> 0.13
        assert_eq!(apply(dec!(0.1), dec!(0.025), dec!(0)), dec!(0.13));
        assert_eq!(apply(dec!(1), dec!(2), dec!(0.3333)), dec!(4.00));
    }

    #[test]
    fn overflowing_sum_is_rejected() {
        assert_eq!(
            apply_rate(Decimal::MAX, Decimal::MAX, rate(dec!(0.10))),
            Err(ValidationError::Overflow { operation: "number1 + number2" })
        );
    }

    #[test]
    fn overflowing_increase_is_rejected() {
        let error = apply_rate(Decimal::MAX, dec!(0), rate(dec!(2))).expect_err("overflow");
        assert_eq!(error, ValidationError::Overflow { operation: "sum * rate" });

        let error = apply_rate(Decimal::MAX, dec!(0), rate(dec!(0.5))).expect_err("overflow");
        assert_eq!(error, ValidationError::Overflow { operation: "sum + increase" });
    }

    #[test]
    fn zero_rate_at_the_range_boundary_is_exact() {
        let result = apply_rate(Decimal::MAX, dec!(0), rate(dec!(0))).expect("in range");
        assert_eq!(result, Decimal::MAX);
    }

    struct FixedSource(RateValue);

    impl crate::source::RateSource for FixedSource {
        fn id(&self) -> &str {
            "fixed"
        }

        fn fetch<'a>(&'a self) -> crate::BoxFuture<'a, Result<RateValue, RateError>> {
            Box::pin(async move { Ok(self.0) })
        }
    }

    #[tokio::test]
    async fn calculator_reports_overflow_as_invalid_input() {
        let resolver = Arc::new(Resolver::builder(Arc::new(FixedSource(rate(dec!(0.10))))).build());
        let calculator = Calculator::new(resolver);

        let error = calculator
            .calculate(Decimal::MAX, Decimal::MAX)
            .await
            .expect_err("overflow");

        assert!(matches!(error, RateError::Invalid(ValidationError::Overflow { .. })), "{error:?}");
        assert_eq!(error.code(), "input.invalid");
    }
}
