//! Shared utilities.

pub mod decimal;

pub use decimal::{fraction_of, safe_div, to_f64, weighted_average};
