//! Binance public klines client.

use super::data::{trim_unclosed, CandleSource};
use crate::config::DataConfig;
use crate::market::{Candle, Interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument};

/// Maximum klines Binance returns per request.
const MAX_PAGE_LIMIT: usize = 1000;

/// Unauthenticated client for `/api/v3/klines`.
pub struct BinanceKlineClient {
    http: Client,
    base_url: String,
    page_limit: usize,
}

impl BinanceKlineClient {
    pub fn new(config: &DataConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.binance_base_url.trim_end_matches('/').to_string(),
            page_limit: MAX_PAGE_LIMIT,
        })
    }

    /// Klines requested per page, capped at the exchange maximum.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    /// Fetch one page of klines opening at or after `start_ms`.
    #[instrument(skip(self))]
    async fn get_klines_page(
        &self,
        instrument: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Value>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url,
            urlencoding::encode(instrument),
            urlencoding::encode(interval.as_str()),
            start_ms,
            end_ms,
            self.page_limit
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Klines request failed with {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse klines response")
    }
}

#[async_trait]
impl CandleSource for BinanceKlineClient {
    async fn fetch_candles(
        &self,
        instrument: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let symbol = instrument.to_uppercase();
        let end_ms = end.timestamp_millis();
        let now = Utc::now();
        let mut cursor = start.timestamp_millis();
        let mut candles = Vec::new();

        while cursor <= end_ms {
            let page = self
                .get_klines_page(&symbol, interval, cursor, end_ms)
                .await?;
            let page_len = page.len();

            let mut last_close_ms = None;
            for raw in &page {
                let (close_ms, candle) = parse_kline(raw, &symbol, interval, now)
                    .with_context(|| format!("Malformed kline for {}: {}", symbol, raw))?;
                last_close_ms = Some(close_ms);
                candles.push(candle);
            }

            debug!(%symbol, %interval, page = page_len, total = candles.len(), "Fetched klines page");

            match last_close_ms {
                Some(close_ms) if page_len >= self.page_limit => cursor = close_ms + 1,
                _ => break,
            }
        }

        candles.retain(|c| c.close_time <= end);
        trim_unclosed(&mut candles);
        Ok(candles)
    }
}

/// Parse one kline array. Returns Binance's raw close time in milliseconds
/// and the candle, whose close time is one millisecond later so it lands on
/// the interval boundary.
fn parse_kline(
    raw: &Value,
    instrument: &str,
    interval: Interval,
    now: DateTime<Utc>,
) -> Result<(i64, Candle)> {
    let fields = raw.as_array().context("Kline is not an array")?;
    anyhow::ensure!(fields.len() >= 7, "Expected at least 7 kline fields, got {}", fields.len());

    let decimal = |idx: usize| -> Result<Decimal> {
        let text = fields[idx]
            .as_str()
            .with_context(|| format!("Kline field {} is not a string", idx))?;
        text.parse()
            .with_context(|| format!("Invalid decimal in kline field {}: {}", idx, text))
    };

    let close_ms = fields[6].as_i64().context("Kline close time is not an integer")?;
    let close_time = Utc
        .timestamp_millis_opt(close_ms)
        .single()
        .context("Kline close time out of range")?
        + Duration::milliseconds(1);

    let candle = Candle {
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        volume: decimal(5)?,
        close_time,
        is_close: close_time <= now,
        instrument: instrument.to_string(),
        interval,
    };
    Ok((close_ms, candle))
}
