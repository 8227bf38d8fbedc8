//! End-to-end backtest runner.
//!
//! Loads every series, splits each into a warm-up and a replay portion,
//! seeds the exchange and replays the rest through a strategy.

use super::clock::SimulationClock;
use super::data::CandleSource;
use super::metrics::{BacktestMetrics, EquityPoint, TradeActivity};
use crate::config::Config;
use crate::exchange::ExchangeSimulator;
use crate::ledger::{AssetState, FillRecord, LiquidationEvent, PortfolioLedger, PortfolioSnapshot};
use crate::market::{base_asset, Candle, Interval};
use crate::strategy::Strategy;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// One (instrument, interval) feed to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SeriesSpec {
    pub instrument: String,
    pub interval: Interval,
}

impl SeriesSpec {
    pub fn new(instrument: &str, interval: Interval) -> Self {
        Self {
            instrument: instrument.to_uppercase(),
            interval,
        }
    }
}

impl fmt::Display for SeriesSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instrument, self.interval)
    }
}

/// Parses `INSTRUMENT:interval`, e.g. `BTCUSDT:1h`.
impl FromStr for SeriesSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (instrument, interval) = s
            .split_once(':')
            .with_context(|| format!("Expected INSTRUMENT:interval, got {}", s))?;
        anyhow::ensure!(!instrument.is_empty(), "Empty instrument in {}", s);
        Ok(Self::new(instrument, interval.parse()?))
    }
}

/// Outcome of a backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub metrics: BacktestMetrics,
    pub equity_curve: Vec<EquityPoint>,
    /// Spot and futures records, in time order
    pub fills: Vec<FillRecord>,
    pub liquidations: Vec<LiquidationEvent>,
    /// Equal-weight buy-and-hold worth per snapshot
    pub benchmark: Vec<(DateTime<Utc>, Decimal)>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub candles_replayed: usize,
    pub ticks: usize,
}

impl BacktestResult {
    /// Export equity curve to CSV.
    pub fn equity_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(
            file,
            "timestamp,balance,margin,unrealized_pnl,total_equity,drawdown,positions"
        )?;

        for point in &self.equity_curve {
            writeln!(
                file,
                "{},{},{},{},{},{},{}",
                point.timestamp.to_rfc3339(),
                point.balance,
                point.margin,
                point.unrealized_pnl,
                point.total_equity,
                point.drawdown,
                point.position_count,
            )?;
        }

        Ok(())
    }

    /// Export the order books to CSV.
    pub fn fills_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(file, "time,order_id,instrument,side,amount,price,filled,percent")?;

        for fill in &self.fills {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{}",
                fill.time.to_rfc3339(),
                fill.order_id.map(|id| id.to_string()).unwrap_or_default(),
                fill.instrument,
                fill.side,
                fill.amount,
                fill.price,
                fill.filled,
                fill.percent,
            )?;
        }

        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        format!(
            "{}\n\nStrategy: {}\nBacktest Period: {} to {}\nCandles: {}\nTicks: {}",
            self.metrics.summary(),
            self.strategy,
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"),
            self.candles_replayed,
            self.ticks,
        )
    }
}

/// Drives a full backtest from a candle source.
pub struct BacktestRunner<D: CandleSource> {
    source: D,
    config: Config,
}

impl<D: CandleSource> BacktestRunner<D> {
    pub fn new(source: D, config: Config) -> Self {
        Self { source, config }
    }

    /// Fetch every series. Empty series are an error.
    pub async fn load(
        &self,
        series: &[SeriesSpec],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Vec<Candle>>> {
        let mut feeds = Vec::with_capacity(series.len());
        for spec in series {
            let candles = self
                .source
                .fetch_candles(&spec.instrument, spec.interval, start, end)
                .await
                .with_context(|| format!("Failed to load {}", spec))?;
            if candles.is_empty() {
                anyhow::bail!("No candles for {} between {} and {}", spec, start, end);
            }
            info!(series = %spec, candles = candles.len(), "Series loaded");
            feeds.push(candles);
        }
        Ok(feeds)
    }

    /// Load and replay.
    pub async fn run<S: Strategy>(
        &self,
        strategy: &mut S,
        series: &[SeriesSpec],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestResult> {
        let feeds = self.load(series, start, end).await?;
        self.run_loaded(strategy, feeds)
    }

    /// Replay already loaded feeds.
    ///
    /// The leading `train_fraction` of each feed only warms up history. The
    /// ledger starts at the latest warm-up close with zero base holdings
    /// priced at their last warm-up close. Candles closing at or before that
    /// start are warm-up for every feed.
    pub fn run_loaded<S: Strategy>(
        &self,
        strategy: &mut S,
        feeds: Vec<Vec<Candle>>,
    ) -> Result<BacktestResult> {
        let quote = self.config.simulation.quote_asset.clone();
        let fraction = self.config.backtest.train_fraction;

        let start = warm_up_end(&feeds, fraction)
            .or_else(|| feeds.iter().filter_map(|f| f.first()).map(|c| c.close_time).min())
            .context("No candles to replay")?;

        let mut warm_up = Vec::with_capacity(feeds.len());
        let mut replay = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let (history, rest): (Vec<Candle>, Vec<Candle>) =
                feed.into_iter().partition(|c| c.close_time <= start);
            warm_up.push(history);
            replay.push(rest);
        }

        let holdings = initial_holdings(
            &quote,
            self.config.backtest.initial_quote_balance,
            &warm_up,
            &replay,
        );
        let base_assets: Vec<String> = holdings
            .keys()
            .filter(|asset| **asset != quote)
            .cloned()
            .collect();

        let mut exchange = ExchangeSimulator::new(&self.config.simulation, holdings, start)?;
        for history in warm_up.iter().filter(|h| !h.is_empty()) {
            let first = &history[0];
            exchange.add_history(&first.instrument, first.interval, history)?;
        }

        let clock = SimulationClock::new(replay);
        info!(
            strategy = strategy.name(),
            %start,
            warm_up = warm_up.iter().map(Vec::len).sum::<usize>(),
            replay = clock.len(),
            "Backtest prepared"
        );

        let summary = clock.run(strategy, &mut exchange)?;

        let open_orders = exchange.open_orders().count();
        if open_orders > 0 {
            warn!(open_orders, "Orders left unfilled at end of replay");
        }

        let ledger = exchange.into_ledger();
        let benchmark = benchmark_series(&ledger, &base_assets)?;
        let activity = trade_activity(&ledger);
        let metrics = BacktestMetrics::calculate(
            &summary.equity_curve,
            ledger.start_worth(),
            &activity,
            benchmark.last().map(|(_, worth)| *worth),
        );

        let mut fills: Vec<FillRecord> = ledger
            .spot_book()
            .iter()
            .chain(ledger.future_book())
            .cloned()
            .collect();
        fills.sort_by_key(|f| f.time);

        let end_time = summary
            .equity_curve
            .last()
            .map(|p| p.timestamp)
            .unwrap_or(start);

        info!(
            strategy = strategy.name(),
            return_pct = %metrics.total_return_pct.round_dp(2),
            benchmark_pct = %metrics.benchmark_return_pct.round_dp(2),
            fills = fills.len(),
            liquidations = metrics.liquidations,
            "Backtest complete"
        );

        Ok(BacktestResult {
            strategy: strategy.name().to_string(),
            metrics,
            equity_curve: summary.equity_curve,
            fills,
            liquidations: ledger.positions().liquidations().to_vec(),
            benchmark,
            snapshots: ledger.history().cloned().collect(),
            start_time: start,
            end_time,
            candles_replayed: summary.candles,
            ticks: summary.ticks,
        })
    }
}

/// Close time of the latest warm-up candle across feeds, if any feed has one.
fn warm_up_end(feeds: &[Vec<Candle>], fraction: Decimal) -> Option<DateTime<Utc>> {
    feeds
        .iter()
        .filter_map(|feed| {
            let split = (Decimal::from(feed.len()) * fraction)
                .floor()
                .to_usize()
                .unwrap_or(0);
            split.checked_sub(1).and_then(|i| feed.get(i))
        })
        .map(|c| c.close_time)
        .max()
}

/// Quote balance plus a zero holding for every base asset, priced at its last
/// warm-up close or, failing that, its first replay open.
fn initial_holdings(
    quote: &str,
    quote_balance: Decimal,
    warm_up: &[Vec<Candle>],
    replay: &[Vec<Candle>],
) -> BTreeMap<String, AssetState> {
    let mut latest: BTreeMap<String, (DateTime<Utc>, Decimal)> = BTreeMap::new();
    for candle in warm_up.iter().filter_map(|h| h.last()) {
        let entry = latest
            .entry(candle.instrument.clone())
            .or_insert((candle.close_time, candle.close));
        if candle.close_time > entry.0 {
            *entry = (candle.close_time, candle.close);
        }
    }
    for candle in replay.iter().filter_map(|r| r.first()) {
        latest
            .entry(candle.instrument.clone())
            .or_insert((candle.close_time, candle.open));
    }

    let mut holdings = BTreeMap::new();
    holdings.insert(quote.to_string(), AssetState::new(quote_balance, Decimal::ONE));
    for (instrument, (_, price)) in latest {
        let base = base_asset(&instrument, quote);
        if base != instrument && base != quote {
            holdings.insert(base.to_string(), AssetState::new(Decimal::ZERO, price));
        }
    }
    holdings
}

/// Equal-weight buy-and-hold of every base asset.
fn benchmark_series(
    ledger: &PortfolioLedger,
    base_assets: &[String],
) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
    if base_assets.is_empty() {
        return Ok(Vec::new());
    }
    let share = Decimal::ONE / Decimal::from(base_assets.len());
    let mut allocations: Vec<(&str, Decimal)> =
        base_assets.iter().map(|a| (a.as_str(), share)).collect();
    // Last share absorbs the rounding so the total is exactly one
    let others = share * Decimal::from(base_assets.len() - 1);
    if let Some(last) = allocations.last_mut() {
        last.1 = Decimal::ONE - others;
    }
    Ok(ledger.buy_and_hold_series(&allocations)?)
}

fn trade_activity(ledger: &PortfolioLedger) -> TradeActivity {
    let futures_fills = ledger
        .future_book()
        .iter()
        .filter(|f| f.side != "LIQUIDATED")
        .count();
    TradeActivity {
        spot_fills: ledger.spot_book().len() as u64,
        futures_fills: futures_fills as u64,
        liquidations: ledger.liquidation_count() as u64,
        total_fees: ledger.total_fees(),
        realized_pnl: ledger.realized_pnl(),
    }
}
