//! Fixed-capacity rolling history of candle fields.

use crate::error::{SimError, SimResult};
use crate::market::candle::{Candle, Field, Interval};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Circular buffer that keeps the most recent `capacity` samples.
///
/// Storage is allocated once at construction; `enqueue` overwrites the
/// oldest sample once the buffer is full and never reallocates.
#[derive(Debug, Clone)]
pub struct RingHistory<T> {
    buf: Vec<T>,
    capacity: usize,
    /// Physical index of the oldest sample (only moves once full)
    head: usize,
}

impl<T: Clone> RingHistory<T> {
    /// Create a buffer pre-filled with the last `capacity` seed values.
    pub fn new(seed: &[T], capacity: usize) -> SimResult<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidConfig(
                "history capacity must be at least 1".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(capacity);
        let skip = seed.len().saturating_sub(capacity);
        buf.extend(seed[skip..].iter().cloned());

        Ok(Self {
            buf,
            capacity,
            head: 0,
        })
    }

    /// Append a sample, dropping the oldest one when full.
    pub fn enqueue(&mut self, value: T) {
        if self.buf.len() < self.capacity {
            self.buf.push(value);
        } else {
            self.buf[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// The `k` most recent samples, oldest first.
    pub fn window(&self, k: usize) -> SimResult<Vec<T>> {
        if k > self.buf.len() {
            return Err(SimError::Range {
                requested: k as i64,
                available: self.buf.len(),
            });
        }
        Ok(self.iter().skip(self.buf.len() - k).cloned().collect())
    }

    /// Signed variant of [`window`](Self::window) for callers holding an `i64`.
    pub fn window_signed(&self, k: i64) -> SimResult<Vec<T>> {
        if k < 0 {
            return Err(SimError::Range {
                requested: k,
                available: self.buf.len(),
            });
        }
        self.window(k as usize)
    }

    /// Oldest retained sample.
    pub fn peek(&self) -> Option<&T> {
        self.buf.get(self.head)
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&T> {
        if self.buf.is_empty() {
            return None;
        }
        let idx = (self.head + self.buf.len() - 1) % self.buf.len();
        self.buf.get(idx)
    }

    /// Iterate samples in chronological order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (newer, older) = self.buf.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Open/High/Low/Close rings for one instrument and interval.
#[derive(Debug, Clone)]
pub struct OhlcHistory {
    open: RingHistory<Decimal>,
    high: RingHistory<Decimal>,
    low: RingHistory<Decimal>,
    close: RingHistory<Decimal>,
}

impl OhlcHistory {
    /// Build rings seeded from warm-up candles.
    pub fn from_candles(candles: &[Candle], capacity: usize) -> SimResult<Self> {
        let column = |field: Field| -> Vec<Decimal> {
            candles.iter().map(|c| c.field(field)).collect()
        };

        Ok(Self {
            open: RingHistory::new(&column(Field::Open), capacity)?,
            high: RingHistory::new(&column(Field::High), capacity)?,
            low: RingHistory::new(&column(Field::Low), capacity)?,
            close: RingHistory::new(&column(Field::Close), capacity)?,
        })
    }

    pub fn record(&mut self, candle: &Candle) {
        self.open.enqueue(candle.open);
        self.high.enqueue(candle.high);
        self.low.enqueue(candle.low);
        self.close.enqueue(candle.close);
    }

    pub fn field(&self, field: Field) -> &RingHistory<Decimal> {
        match field {
            Field::Open => &self.open,
            Field::High => &self.high,
            Field::Low => &self.low,
            Field::Close => &self.close,
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }
}

/// All rolling histories, keyed by (instrument, interval).
#[derive(Debug, Clone)]
pub struct MarketHistory {
    memory_length: usize,
    series: HashMap<(String, Interval), OhlcHistory>,
}

impl MarketHistory {
    pub fn new(memory_length: usize) -> Self {
        Self {
            memory_length,
            series: HashMap::new(),
        }
    }

    /// Seed (or replace) the history of one series with warm-up candles.
    pub fn add_history(
        &mut self,
        instrument: &str,
        interval: Interval,
        candles: &[Candle],
    ) -> SimResult<()> {
        let history = OhlcHistory::from_candles(candles, self.memory_length)?;
        self.series
            .insert((instrument.to_string(), interval), history);
        Ok(())
    }

    /// Append a candle to its series, creating the series on first sight.
    pub fn record(&mut self, candle: &Candle) -> SimResult<()> {
        let key = (candle.instrument.clone(), candle.interval);
        if !self.series.contains_key(&key) {
            let empty = OhlcHistory::from_candles(&[], self.memory_length)?;
            self.series.insert(key.clone(), empty);
        }
        if let Some(history) = self.series.get_mut(&key) {
            history.record(candle);
        }
        Ok(())
    }

    pub fn get(&self, instrument: &str, interval: Interval) -> Option<&OhlcHistory> {
        self.series.get(&(instrument.to_string(), interval))
    }

    /// The `k` most recent values of a field, oldest first.
    pub fn window(
        &self,
        field: Field,
        instrument: &str,
        interval: Interval,
        k: usize,
    ) -> SimResult<Vec<Decimal>> {
        match self.get(instrument, interval) {
            Some(history) => history.field(field).window(k),
            None if k == 0 => Ok(Vec::new()),
            None => Err(SimError::Range {
                requested: k as i64,
                available: 0,
            }),
        }
    }

    /// Latest close across all intervals of an instrument, finest interval wins.
    pub fn last_close(&self, instrument: &str) -> Option<Decimal> {
        self.series
            .iter()
            .filter(|((inst, _), _)| inst == instrument)
            .min_by_key(|((_, interval), _)| *interval)
            .and_then(|(_, h)| h.field(Field::Close).latest().copied())
    }

    pub fn memory_length(&self) -> usize {
        self.memory_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(instrument: &str, interval: Interval, minute: i64, close: Decimal) -> Candle {
        Candle {
            open: close - dec!(1),
            high: close + dec!(2),
            low: close - dec!(2),
            close,
            volume: dec!(10),
            close_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
            is_close: true,
            instrument: instrument.to_string(),
            interval,
        }
    }

    // =========================================================================
    // RingHistory Tests
    // =========================================================================

    #[test]
    fn test_seeded_then_enqueue() {
        let mut ring = RingHistory::new(&[dec!(10), dec!(11), dec!(12)], 3).unwrap();
        ring.enqueue(dec!(13));

        assert_eq!(ring.window(3).unwrap(), vec![dec!(11), dec!(12), dec!(13)]);
        assert_eq!(ring.peek(), Some(&dec!(11)));
        assert_eq!(ring.latest(), Some(&dec!(13)));
    }

    #[test]
    fn test_partial_fill_reads_inserted_only() {
        let mut ring = RingHistory::new(&[1u32, 2], 5).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.window(2).unwrap(), vec![1, 2]);

        ring.enqueue(3);
        assert_eq!(ring.to_vec(), vec![1, 2, 3]);
        assert!(ring.window(4).is_err());
    }

    #[test]
    fn test_wraps_many_times() {
        let capacity = 4;
        let mut ring = RingHistory::new(&[], capacity).unwrap();
        for n in 0..23u32 {
            ring.enqueue(n);
        }

        assert_eq!(ring.len(), capacity);
        assert_eq!(ring.window(capacity).unwrap(), vec![19, 20, 21, 22]);
        assert_eq!(ring.window(2).unwrap(), vec![21, 22]);
        assert_eq!(ring.peek(), Some(&19));
    }

    #[test]
    fn test_window_matches_tail_for_every_capacity() {
        for capacity in 1..8usize {
            let mut ring = RingHistory::new(&[], capacity).unwrap();
            let values: Vec<usize> = (0..capacity * 3 + 1).collect();
            for v in &values {
                ring.enqueue(*v);
            }
            let expected = values[values.len() - capacity..].to_vec();
            assert_eq!(ring.window(capacity).unwrap(), expected);
            assert!(ring.window(capacity + 1).is_err());
        }
    }

    #[test]
    fn test_oversized_seed_keeps_tail() {
        let ring = RingHistory::new(&[1, 2, 3, 4, 5], 3).unwrap();
        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
    }

    #[test]
    fn test_window_range_errors() {
        let ring = RingHistory::new(&[1, 2], 3).unwrap();
        assert_eq!(
            ring.window(3),
            Err(SimError::Range {
                requested: 3,
                available: 2
            })
        );
        assert!(matches!(
            ring.window_signed(-1),
            Err(SimError::Range { requested: -1, .. })
        ));
        assert_eq!(ring.window(0).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(RingHistory::<u8>::new(&[], 0).is_err());
    }

    #[test]
    fn test_no_reallocation() {
        let mut ring = RingHistory::new(&[], 16).unwrap();
        let cap_before = ring.buf.capacity();
        for n in 0..1000 {
            ring.enqueue(n);
        }
        assert_eq!(ring.buf.capacity(), cap_before);
    }

    // =========================================================================
    // MarketHistory Tests
    // =========================================================================

    #[test]
    fn test_market_history_seed_and_record() {
        let mut history = MarketHistory::new(3);
        let seed: Vec<Candle> = [dec!(10), dec!(11), dec!(12)]
            .iter()
            .enumerate()
            .map(|(i, c)| candle("BTCQUOTE", Interval::Hour1, i as i64 * 60, *c))
            .collect();
        history
            .add_history("BTCQUOTE", Interval::Hour1, &seed)
            .unwrap();

        history
            .record(&candle("BTCQUOTE", Interval::Hour1, 180, dec!(13)))
            .unwrap();

        let closes = history
            .window(Field::Close, "BTCQUOTE", Interval::Hour1, 3)
            .unwrap();
        assert_eq!(closes, vec![dec!(11), dec!(12), dec!(13)]);

        let highs = history
            .window(Field::High, "BTCQUOTE", Interval::Hour1, 1)
            .unwrap();
        assert_eq!(highs, vec![dec!(15)]);
    }

    #[test]
    fn test_market_history_creates_series_on_record() {
        let mut history = MarketHistory::new(10);
        history
            .record(&candle("ETHUSDT", Interval::Minute5, 5, dec!(2000)))
            .unwrap();

        let ohlc = history.get("ETHUSDT", Interval::Minute5).unwrap();
        assert_eq!(ohlc.len(), 1);
        assert!(history
            .window(Field::Close, "ETHUSDT", Interval::Hour1, 1)
            .is_err());
    }

    #[test]
    fn test_last_close_prefers_finest_interval() {
        let mut history = MarketHistory::new(10);
        history
            .record(&candle("BTCUSDT", Interval::Hour1, 60, dec!(100)))
            .unwrap();
        history
            .record(&candle("BTCUSDT", Interval::Minute1, 61, dec!(101)))
            .unwrap();

        assert_eq!(history.last_close("BTCUSDT"), Some(dec!(101)));
        assert_eq!(history.last_close("ETHUSDT"), None);
    }
}
