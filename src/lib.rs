//! # kline-sim
//!
//! A deterministic candle-replay backtesting engine for spot and leveraged
//! futures strategies.
//!
//! ## Architecture
//!
//! - `market`: Candles, intervals and fixed-capacity rolling history
//! - `ledger`: Portfolio snapshots, futures positions and fill accounting
//! - `exchange`: Orders and the settling exchange simulator
//! - `strategy`: Strategy trait, per-interval routing and a crossover strategy
//! - `backtest`: Candle sources, the replay clock, the runner and metrics
//! - `persistence`: SQLite storage of completed runs
//! - `config`: Configuration management and validation
//! - `error`: Simulation error type
//! - `utils`: Shared decimal arithmetic

pub mod backtest;
pub mod config;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod market;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{SimError, SimResult};
