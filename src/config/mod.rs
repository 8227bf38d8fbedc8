//! Configuration management for kline-sim.
//!
//! Loads settings from an optional `config` file and `KSIM__*` environment variables.

use crate::exchange::LimitFillPolicy;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange simulator and ledger parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Historical data source settings
    #[serde(default)]
    pub data: DataConfig,
    /// Backtest run settings
    #[serde(default)]
    pub backtest: BacktestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Candles retained per (instrument, interval) ring
    #[serde(default = "default_memory_length")]
    pub memory_length: usize,
    /// Orders with smaller notional are dropped at submission
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Live snapshot count that triggers archiving
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
    /// Fee charged on every fill as a fraction of notional
    #[serde(default)]
    pub fee_rate: Decimal,
    /// How limit and stop-limit orders settle
    #[serde(default)]
    pub limit_fill_policy: LimitFillPolicy,
    /// Asset every instrument is quoted in
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Binance spot REST endpoint
    #[serde(default = "default_binance_base_url")]
    pub binance_base_url: String,
    /// Directory holding cached CSV candles
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting quote balance
    #[serde(default = "default_initial_quote_balance")]
    pub initial_quote_balance: Decimal,
    /// Leading share of every series used only to warm up history (0.0-1.0)
    #[serde(default = "default_train_fraction")]
    pub train_fraction: Decimal,
    /// SQLite database for completed runs
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

// Default value functions
fn default_memory_length() -> usize {
    500
}

fn default_min_notional() -> Decimal {
    Decimal::new(20, 0) // 20 quote units
}

fn default_compaction_threshold() -> usize {
    1000
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_binance_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_initial_quote_balance() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_train_fraction() -> Decimal {
    Decimal::new(2, 1) // 0.2
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/runs.db")
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("KSIM"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.simulation.memory_length > 0,
            "memory_length must be positive"
        );

        anyhow::ensure!(
            self.simulation.compaction_threshold > 0,
            "compaction_threshold must be positive"
        );

        anyhow::ensure!(
            self.simulation.fee_rate >= Decimal::ZERO && self.simulation.fee_rate < Decimal::ONE,
            "fee_rate must be within [0, 1)"
        );

        anyhow::ensure!(
            self.simulation.min_notional >= Decimal::ZERO,
            "min_notional must not be negative"
        );

        anyhow::ensure!(
            !self.simulation.quote_asset.is_empty(),
            "quote_asset must not be empty"
        );

        anyhow::ensure!(
            self.backtest.train_fraction >= Decimal::ZERO
                && self.backtest.train_fraction < Decimal::ONE,
            "train_fraction must be within [0, 1)"
        );

        anyhow::ensure!(
            self.backtest.initial_quote_balance > Decimal::ZERO,
            "initial_quote_balance must be positive"
        );

        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            memory_length: default_memory_length(),
            min_notional: default_min_notional(),
            compaction_threshold: default_compaction_threshold(),
            fee_rate: Decimal::ZERO,
            limit_fill_policy: LimitFillPolicy::default(),
            quote_asset: default_quote_asset(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            binance_base_url: default_binance_base_url(),
            cache_dir: default_cache_dir(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_quote_balance: default_initial_quote_balance(),
            train_fraction: default_train_fraction(),
            db_path: default_db_path(),
        }
    }
}
