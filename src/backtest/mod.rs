//! Backtesting: candle sources, the replay clock, the end-to-end runner and
//! performance metrics.
//!
//! # Example
//!
//! ```rust,ignore
//! use kline_sim::backtest::{BacktestRunner, CsvCandleLoader, SeriesSpec};
//! use kline_sim::strategy::{SmaCross, SmaCrossMode};
//!
//! let loader = CsvCandleLoader::new("cache");
//! let runner = BacktestRunner::new(loader, Config::load()?);
//! let mut strategy = SmaCross::new("BTC", "USDT", Interval::Hour1, 10, 30, SmaCrossMode::Spot);
//!
//! let result = runner.run(&mut strategy, &[SeriesSpec::new("BTCUSDT", Interval::Hour1)], start, end).await?;
//! println!("Return: {:.2}%", result.metrics.total_return_pct);
//! ```

mod binance;
mod clock;
mod data;
mod metrics;
mod runner;

pub use binance::BinanceKlineClient;
pub use clock::{ReplaySummary, SimulationClock};
pub use data::{CandleSource, CsvCandleLoader, CsvCandleWriter};
pub use metrics::{BacktestMetrics, EquityPoint, TradeActivity};
pub use runner::{BacktestResult, BacktestRunner, SeriesSpec};
