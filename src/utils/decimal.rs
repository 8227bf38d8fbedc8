//! Decimal helpers for ledger arithmetic.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Share of `part` in `whole`; zero when `whole` is not positive.
pub fn fraction_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole > Decimal::ZERO {
        part / whole
    } else {
        Decimal::ZERO
    }
}

/// Calculate weighted average of (value, weight) pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// Lossy conversion for statistics that need floating point.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
