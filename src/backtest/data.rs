//! Historical candle loading for backtesting.
//!
//! Provides the `CandleSource` boundary plus a CSV cache reader and writer.

use crate::market::{Candle, Interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CSV_HEADER: &str = "close_time,open,high,low,close,volume,is_close";

/// Source of historical candles for one (instrument, interval) series.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles closing within `[start, end]`, ascending by close time, with
    /// a still-forming last candle excluded.
    async fn fetch_candles(
        &self,
        instrument: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// Drop a trailing candle that has not closed yet.
pub(crate) fn trim_unclosed(candles: &mut Vec<Candle>) {
    if candles.last().is_some_and(|c| !c.is_close) {
        candles.pop();
    }
}

/// CSV candle cache reader.
///
/// One file per series at `<dir>/<INSTRUMENT>/<interval>.csv`:
/// ```csv
/// close_time,open,high,low,close,volume,is_close
/// 2024-01-01T01:00:00.000Z,42000.5,42100,41950,42050.25,812.4,true
/// ```
/// `close_time` may also be given as epoch milliseconds.
#[derive(Debug, Clone)]
pub struct CsvCandleLoader {
    dir: PathBuf,
}

impl CsvCandleLoader {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn series_path(&self, instrument: &str, interval: Interval) -> PathBuf {
        series_path(&self.dir, instrument, interval)
    }

    /// Load a whole cached series.
    pub fn load_series(&self, instrument: &str, interval: Interval) -> Result<Vec<Candle>> {
        let path = self.series_path(instrument, interval);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        let candles = Self::from_csv_content(&content, instrument, interval)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        debug!(%instrument, %interval, candles = candles.len(), "Loaded cached series");
        Ok(candles)
    }

    /// Parse CSV content for one series, sorted by close time.
    pub fn from_csv_content(
        content: &str,
        instrument: &str,
        interval: Interval,
    ) -> Result<Vec<Candle>> {
        let mut candles = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            // Skip header
            if line_num == 0 && line.starts_with("close_time") {
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            let row = CsvRow::parse(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            candles.push(row.into_candle(instrument, interval));
        }

        if candles.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        candles.sort_by_key(|c| c.close_time);
        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for CsvCandleLoader {
    async fn fetch_candles(
        &self,
        instrument: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut candles: Vec<Candle> = self
            .load_series(instrument, interval)?
            .into_iter()
            .filter(|c| c.close_time >= start && c.close_time <= end)
            .collect();
        trim_unclosed(&mut candles);
        Ok(candles)
    }
}

/// CSV candle cache writer, the counterpart of [`CsvCandleLoader`].
#[derive(Debug, Clone)]
pub struct CsvCandleWriter {
    dir: PathBuf,
}

impl CsvCandleWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Write one series, replacing any cached file. Returns the file path.
    pub fn write_series(
        &self,
        instrument: &str,
        interval: Interval,
        candles: &[Candle],
    ) -> Result<PathBuf> {
        let path = series_path(&self.dir, instrument, interval);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut content = String::with_capacity(64 * (candles.len() + 1));
        content.push_str(CSV_HEADER);
        content.push('\n');
        for candle in candles {
            writeln!(
                content,
                "{},{},{},{},{},{},{}",
                candle.close_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.is_close
            )?;
        }

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(%instrument, %interval, candles = candles.len(), path = %path.display(), "Series cached");
        Ok(path)
    }
}

fn series_path(dir: &Path, instrument: &str, interval: Interval) -> PathBuf {
    dir.join(instrument.to_uppercase())
        .join(format!("{}.csv", interval.as_str()))
}

/// Internal struct for parsing CSV rows.
#[derive(Debug)]
struct CsvRow {
    close_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    is_close: bool,
}

impl CsvRow {
    fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 6 {
            anyhow::bail!(
                "Expected at least 6 columns (close_time,open,high,low,close,volume[,is_close]), got {}",
                parts.len()
            );
        }

        let decimal = |idx: usize, name: &str| -> Result<Decimal> {
            parts[idx]
                .parse()
                .with_context(|| format!("Invalid {}: {}", name, parts[idx]))
        };

        Ok(Self {
            close_time: parse_time(parts[0])?,
            open: decimal(1, "open")?,
            high: decimal(2, "high")?,
            low: decimal(3, "low")?,
            close: decimal(4, "close")?,
            volume: decimal(5, "volume")?,
            is_close: match parts.get(6) {
                Some(flag) => flag
                    .to_ascii_lowercase()
                    .parse()
                    .with_context(|| format!("Invalid is_close: {}", flag))?,
                None => true,
            },
        })
    }

    fn into_candle(self, instrument: &str, interval: Interval) -> Candle {
        Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            close_time: self.close_time,
            is_close: self.is_close,
            instrument: instrument.to_uppercase(),
            interval,
        }
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .with_context(|| format!("Invalid close_time: {}", raw));
    }
    raw.parse()
        .with_context(|| format!("Invalid close_time: {}", raw))
}
