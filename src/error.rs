//! Error types for the simulation core.
//!
//! Ledger integrity violations abort a run; liquidations and
//! below-minimum orders are market outcomes and never surface here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the replay, exchange and ledger layers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Side value outside {BUY, SELL} / {LONG, SHORT}
    #[error("invalid order side: {0}")]
    InvalidOrderSide(String),

    /// Attempt to change the leverage of an open futures position
    #[error("leverage mismatch on {instrument}: position has {current}x, order requested {requested}x")]
    LeverageMismatch {
        instrument: String,
        current: u8,
        requested: u8,
    },

    /// Closing more size than the position holds
    #[error("cannot close {requested} of {instrument}: position size is {held}")]
    OverClose {
        instrument: String,
        requested: Decimal,
        held: Decimal,
    },

    /// No open futures position for the instrument
    #[error("no open position for {0}")]
    PositionNotFound(String),

    /// History window outside the retained range
    #[error("window of {requested} exceeds retained count {available}")]
    Range { requested: i64, available: usize },

    /// A ledger update arrived with a timestamp older than the current snapshot
    #[error("timestamp {got} is earlier than last update {last}")]
    NonMonotonicTimestamp {
        got: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    /// Asset not tracked by the portfolio
    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    /// Percentage outside [0, 100]
    #[error("percent must be within [0, 100], got {0}")]
    InvalidPercent(Decimal),

    /// Unrecognized kline interval code
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Inconsistent simulation parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for the simulation core.
pub type SimResult<T> = Result<T, SimError>;
