//! Market data model: candles, intervals and rolling history.

mod candle;
mod history;

pub use candle::{base_asset, Candle, Field, Interval};
pub use history::{MarketHistory, OhlcHistory, RingHistory};
