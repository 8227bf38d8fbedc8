//! Candle and kline interval types.

use crate::error::{SimError, SimResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Binance kline intervals, ordered by duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Minute1,
    Minute3,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
    Day3,
    Week1,
    Month1,
}

impl Interval {
    /// Every supported interval, finest first.
    pub const ALL: [Interval; 15] = [
        Interval::Minute1,
        Interval::Minute3,
        Interval::Minute5,
        Interval::Minute15,
        Interval::Minute30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Day3,
        Interval::Week1,
        Interval::Month1,
    ];

    /// Binance code (e.g. "15m", "1d").
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute3 => "3m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
            Interval::Month1 => "1M",
        }
    }

    /// Duration in minutes. Months count as 30 days.
    pub fn minutes(&self) -> u32 {
        let code = self.as_str();
        let (count, unit) = code.split_at(code.len() - 1);
        let count: u32 = count.parse().unwrap_or(1);
        let unit_minutes = match unit {
            "m" => 1,
            "h" => 60,
            "d" => 24 * 60,
            "w" => 7 * 24 * 60,
            _ => 30 * 24 * 60,
        };
        count * unit_minutes
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| SimError::InvalidInterval(s.to_string()))
    }
}

impl TryFrom<String> for Interval {
    type Error = SimError;

    fn try_from(value: String) -> SimResult<Self> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}

/// OHLC field selector for history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Open,
    High,
    Low,
    Close,
}

/// One OHLCV bar for an instrument and interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    /// False while the bar is still forming
    pub is_close: bool,
    pub instrument: String,
    pub interval: Interval,
}

impl Candle {
    /// Value of a single OHLC field.
    pub fn field(&self, field: Field) -> Decimal {
        match field {
            Field::Open => self.open,
            Field::High => self.high,
            Field::Low => self.low,
            Field::Close => self.close,
        }
    }
}

/// Base asset of an instrument quoted in `quote`, e.g. "BTC" for
/// ("BTCUSDT", "USDT"). Unknown quotes leave the instrument as is.
pub fn base_asset<'a>(instrument: &'a str, quote: &str) -> &'a str {
    instrument
        .strip_suffix(quote)
        .filter(|b| !b.is_empty())
        .unwrap_or(instrument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_minutes() {
        assert_eq!(Interval::Minute1.minutes(), 1);
        assert_eq!(Interval::Minute15.minutes(), 15);
        assert_eq!(Interval::Hour4.minutes(), 240);
        assert_eq!(Interval::Hour12.minutes(), 720);
        assert_eq!(Interval::Day3.minutes(), 3 * 1440);
        assert_eq!(Interval::Week1.minutes(), 10080);
        assert_eq!(Interval::Month1.minutes(), 43200);
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::Hour1);
        assert_eq!("1M".parse::<Interval>().unwrap(), Interval::Month1);
        assert_eq!("1m".parse::<Interval>().unwrap(), Interval::Minute1);
        assert!(matches!(
            "7h".parse::<Interval>(),
            Err(SimError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_interval_ordering_follows_minutes() {
        for pair in Interval::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].minutes() < pair[1].minutes());
        }
    }

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset("BTCUSDT", "USDT"), "BTC");
        assert_eq!(base_asset("ETHBTC", "USDT"), "ETHBTC");
        assert_eq!(base_asset("USDT", "USDT"), "USDT");
    }

    #[test]
    fn test_interval_serde_uses_code() {
        let json = serde_json::to_string(&Interval::Hour4).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: Interval = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(back, Interval::Minute15);
    }
}
