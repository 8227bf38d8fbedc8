//! Deterministic replay clock.
//!
//! Merges candle feeds into one ordered stream, dispatches every candle to
//! the strategy and settles the exchange once per close time.

use super::metrics::EquityPoint;
use crate::error::SimResult;
use crate::exchange::{ExchangeSimulator, Tick};
use crate::ledger::{FillRecord, LiquidationEvent};
use crate::market::Candle;
use crate::strategy::Strategy;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

const DEFAULT_PROGRESS_INTERVAL: usize = 1000;

/// Everything a replay produced.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub candles: usize,
    pub ticks: usize,
    pub fills: Vec<FillRecord>,
    pub liquidations: Vec<LiquidationEvent>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Merged candle stream ready for replay.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    candles: Vec<Candle>,
    progress_interval: usize,
}

impl SimulationClock {
    /// Merge one feed per (instrument, interval).
    pub fn new(feeds: Vec<Vec<Candle>>) -> Self {
        Self {
            candles: merge(feeds),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Log progress every `ticks` ticks.
    pub fn with_progress_interval(mut self, ticks: usize) -> Self {
        self.progress_interval = ticks.max(1);
        self
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Candle groups sharing a close time, in replay order.
    pub fn ticks(&self) -> impl Iterator<Item = &[Candle]> {
        self.candles
            .chunk_by(|a, b| a.close_time == b.close_time)
    }

    /// Replay every tick through `strategy`.
    pub fn run<S: Strategy>(
        &self,
        strategy: &mut S,
        exchange: &mut ExchangeSimulator,
    ) -> SimResult<ReplaySummary> {
        let router = S::routes();
        strategy.prepare(exchange)?;

        info!(
            strategy = strategy.name(),
            candles = self.candles.len(),
            intervals = ?router.intervals(),
            "Starting replay"
        );

        let mut summary = ReplaySummary::default();
        let mut peak_equity = exchange.ledger().start_worth();

        for group in self.ticks() {
            let timestamp = group[0].close_time;
            exchange.set_time(timestamp);

            for candle in group {
                // Forming bars reach the strategy but never the OHLC rings
                if candle.is_close {
                    exchange.record_candle(candle)?;
                }
                router.dispatch(strategy, exchange, candle)?;
            }

            let report = exchange.settle(&Tick::from_candles(timestamp, group))?;
            summary.candles += group.len();
            summary.ticks += 1;
            summary.fills.extend(report.fills);
            summary.liquidations.extend(report.liquidations);

            let point = equity_point(exchange, peak_equity);
            peak_equity = peak_equity.max(point.total_equity);
            summary.equity_curve.push(point);

            if summary.ticks % self.progress_interval == 0 {
                debug!(
                    ticks = summary.ticks,
                    candles = summary.candles,
                    %timestamp,
                    %peak_equity,
                    "Replay progress"
                );
            }
        }

        info!(
            strategy = strategy.name(),
            ticks = summary.ticks,
            fills = summary.fills.len(),
            liquidations = summary.liquidations.len(),
            "Replay complete"
        );

        if exchange.pending_tasks() > 0 {
            warn!(pending = exchange.pending_tasks(), "Unsettled tasks left at end of replay");
        }

        Ok(summary)
    }
}

/// Concatenate feeds and order by (close time, interval length, instrument).
/// The sort is stable, so the result does not depend on feed order.
fn merge(feeds: Vec<Vec<Candle>>) -> Vec<Candle> {
    let mut candles: Vec<Candle> = feeds.into_iter().flatten().collect();
    candles.sort_by(|a, b| {
        a.close_time
            .cmp(&b.close_time)
            .then_with(|| a.interval.minutes().cmp(&b.interval.minutes()))
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
    candles
}

fn equity_point(exchange: &ExchangeSimulator, peak_equity: Decimal) -> EquityPoint {
    let ledger = exchange.ledger();
    let snapshot = ledger.current();
    let spot = snapshot.worth() - snapshot.future_margin - snapshot.future_upnl;
    EquityPoint::new(
        exchange.now(),
        spot,
        snapshot.future_margin,
        snapshot.future_upnl,
        ledger.positions().len(),
        peak_equity,
    )
}
