//! Performance metrics calculation for backtesting.
//!
//! Provides Sharpe ratio, Sortino ratio, drawdown analysis, and a
//! buy-and-hold comparison.

use crate::utils::to_f64;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A point on the equity curve, recorded once per settled tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    /// Quote value of spot holdings
    pub balance: Decimal,
    pub margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_equity: Decimal,
    pub drawdown: Decimal,
    pub position_count: usize,
}

impl EquityPoint {
    /// Create a new equity point.
    pub fn new(
        timestamp: DateTime<Utc>,
        balance: Decimal,
        margin: Decimal,
        unrealized_pnl: Decimal,
        position_count: usize,
        peak_equity: Decimal,
    ) -> Self {
        let total_equity = balance + margin + unrealized_pnl;
        let drawdown = if peak_equity > Decimal::ZERO && peak_equity > total_equity {
            (peak_equity - total_equity) / peak_equity
        } else {
            Decimal::ZERO
        };

        Self {
            timestamp,
            balance,
            margin,
            unrealized_pnl,
            total_equity,
            drawdown,
            position_count,
        }
    }
}

/// Order book and ledger totals that feed the activity section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeActivity {
    pub spot_fills: u64,
    pub futures_fills: u64,
    pub liquidations: u64,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,
}

/// Comprehensive backtest performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Returns
    /// Total absolute return (final - initial)
    pub total_return: Decimal,
    /// Total return as percentage
    pub total_return_pct: Decimal,
    /// Annualized return percentage
    pub annualized_return: Decimal,

    // Risk
    /// Maximum drawdown as a fraction
    pub max_drawdown: Decimal,
    /// Duration of maximum drawdown in hours
    pub max_drawdown_duration_hours: i64,
    /// Annualized volatility (std dev of returns)
    pub volatility: Decimal,

    // Risk-adjusted
    /// Sharpe ratio (assuming 0 risk-free rate)
    pub sharpe_ratio: Decimal,
    /// Sortino ratio (downside deviation only)
    pub sortino_ratio: Decimal,
    /// Calmar ratio (return / max drawdown)
    pub calmar_ratio: Decimal,

    // Benchmark
    /// Buy-and-hold return over the same period, percent
    pub benchmark_return_pct: Decimal,
    /// Strategy return minus benchmark return, percentage points
    pub excess_return_pct: Decimal,

    // Activity
    pub total_fills: u64,
    pub spot_fills: u64,
    pub futures_fills: u64,
    pub liquidations: u64,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,

    // Time
    /// Backtest duration in days
    pub duration_days: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from the equity curve and ledger totals.
    pub fn calculate(
        equity_curve: &[EquityPoint],
        initial_equity: Decimal,
        activity: &TradeActivity,
        benchmark_final: Option<Decimal>,
    ) -> Self {
        let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
            return Self::empty();
        };

        // Duration
        let duration = last.timestamp - first.timestamp;
        let duration_days = duration.num_seconds() as f64 / 86400.0;
        let duration_years = duration_days / 365.0;

        // Returns
        let total_return = last.total_equity - initial_equity;
        let total_return_pct = percent_change(initial_equity, last.total_equity);

        let annualized_return = if duration_years > 0.0 {
            let factor = 1.0 + to_f64(total_return_pct) / 100.0;
            let annualized = factor.max(0.0).powf(1.0 / duration_years) - 1.0;
            Decimal::from_f64_retain(annualized * 100.0).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        // Drawdown
        let (max_drawdown, max_dd_duration) = calculate_max_drawdown(equity_curve);

        // Returns for volatility calculation
        let returns = calculate_period_returns(equity_curve);
        let volatility = calculate_volatility(&returns, duration_years);

        // Risk-adjusted metrics
        let sharpe_ratio = calculate_sharpe(&returns, duration_years);
        let sortino_ratio = calculate_sortino(&returns, duration_years);
        let calmar_ratio = if max_drawdown > Decimal::ZERO {
            annualized_return / (max_drawdown * dec!(100))
        } else {
            Decimal::ZERO
        };

        let benchmark_return_pct = benchmark_final
            .map(|worth| percent_change(initial_equity, worth))
            .unwrap_or(Decimal::ZERO);

        Self {
            total_return,
            total_return_pct,
            annualized_return,
            max_drawdown,
            max_drawdown_duration_hours: max_dd_duration,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            benchmark_return_pct,
            excess_return_pct: total_return_pct - benchmark_return_pct,
            total_fills: activity.spot_fills + activity.futures_fills,
            spot_fills: activity.spot_fills,
            futures_fills: activity.futures_fills,
            liquidations: activity.liquidations,
            total_fees: activity.total_fees,
            realized_pnl: activity.realized_pnl,
            duration_days,
        }
    }

    /// Create empty metrics (for runs without settled ticks).
    pub fn empty() -> Self {
        Self {
            total_return: Decimal::ZERO,
            total_return_pct: Decimal::ZERO,
            annualized_return: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            max_drawdown_duration_hours: 0,
            volatility: Decimal::ZERO,
            sharpe_ratio: Decimal::ZERO,
            sortino_ratio: Decimal::ZERO,
            calmar_ratio: Decimal::ZERO,
            benchmark_return_pct: Decimal::ZERO,
            excess_return_pct: Decimal::ZERO,
            total_fills: 0,
            spot_fills: 0,
            futures_fills: 0,
            liquidations: 0,
            total_fees: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            duration_days: 0.0,
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Total Return:      {:.2} ({:.2}%)
  Annualized:        {:.2}%
  Buy & Hold:        {:.2}%
  Excess:            {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Volatility:        {:.2}%

RISK-ADJUSTED
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}
  Calmar Ratio:      {:.3}

ACTIVITY
  Fills:             {} (spot {}, futures {})
  Liquidations:      {}
  Realized PnL:      {:.2}
  Fees:              {:.2}
═══════════════════════════════════════════════"#,
            self.duration_days,
            self.total_return,
            self.total_return_pct,
            self.annualized_return,
            self.benchmark_return_pct,
            self.excess_return_pct,
            self.max_drawdown * dec!(100),
            self.volatility * dec!(100),
            self.sharpe_ratio,
            self.sortino_ratio,
            self.calmar_ratio,
            self.total_fills,
            self.spot_fills,
            self.futures_fills,
            self.liquidations,
            self.realized_pnl,
            self.total_fees,
        )
    }
}

fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    if from > Decimal::ZERO {
        (to - from) / from * dec!(100)
    } else {
        Decimal::ZERO
    }
}

/// Calculate period returns from equity curve.
fn calculate_period_returns(equity_curve: &[EquityPoint]) -> Vec<Decimal> {
    if equity_curve.len() < 2 {
        return vec![];
    }

    equity_curve
        .windows(2)
        .map(|w| {
            let prev = &w[0];
            let curr = &w[1];
            if prev.total_equity > Decimal::ZERO {
                (curr.total_equity - prev.total_equity) / prev.total_equity
            } else {
                Decimal::ZERO
            }
        })
        .collect()
}

/// Calculate maximum drawdown and its duration.
fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> (Decimal, i64) {
    let Some(first) = equity_curve.first() else {
        return (Decimal::ZERO, 0);
    };

    let mut peak = first.total_equity;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_start: Option<DateTime<Utc>> = None;
    let mut max_dd_duration: i64 = 0;
    let mut current_dd_start: Option<DateTime<Utc>> = None;

    for point in equity_curve {
        if point.total_equity > peak {
            peak = point.total_equity;
            current_dd_start = None;
        } else if peak > Decimal::ZERO {
            if current_dd_start.is_none() {
                current_dd_start = Some(point.timestamp);
            }
            let dd = (peak - point.total_equity) / peak;
            if dd > max_dd {
                max_dd = dd;
                max_dd_start = current_dd_start;
            }
        }

        if let (Some(start), Some(_)) = (max_dd_start, current_dd_start) {
            let duration = (point.timestamp - start).num_hours();
            if duration > max_dd_duration {
                max_dd_duration = duration;
            }
        }
    }

    (max_dd, max_dd_duration)
}

fn returns_as_f64(returns: &[Decimal]) -> Vec<f64> {
    returns.iter().copied().map(to_f64).collect()
}

/// Calculate annualized volatility from returns.
fn calculate_volatility(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.len() < 2 || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64 = returns_as_f64(returns);
    let n = returns_f64.len() as f64;
    let mean = returns_f64.iter().sum::<f64>() / n;
    let variance = returns_f64.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    // Annualize by the observed tick frequency
    let periods_per_year = n / duration_years;
    let annualized = std_dev * periods_per_year.sqrt();

    Decimal::from_f64_retain(annualized).unwrap_or(Decimal::ZERO)
}

/// Calculate Sharpe ratio (assuming 0 risk-free rate).
fn calculate_sharpe(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64 = returns_as_f64(returns);
    let n = returns_f64.len() as f64;
    let mean = returns_f64.iter().sum::<f64>() / n;
    let variance = returns_f64.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev < 1e-10 {
        return Decimal::ZERO;
    }

    let periods_per_year = n / duration_years;
    let annualized_return = mean * periods_per_year;
    let annualized_std = std_dev * periods_per_year.sqrt();

    Decimal::from_f64_retain(annualized_return / annualized_std).unwrap_or(Decimal::ZERO)
}

/// Calculate Sortino ratio (downside deviation only).
fn calculate_sortino(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64 = returns_as_f64(returns);
    let n = returns_f64.len() as f64;
    let mean = returns_f64.iter().sum::<f64>() / n;

    let downside: Vec<f64> = returns_f64.iter().filter(|&&r| r < 0.0).copied().collect();
    if downside.is_empty() {
        // No negative returns: cap instead of dividing by zero
        return dec!(100);
    }

    let downside_variance = downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_deviation = downside_variance.sqrt();
    if downside_deviation < 1e-10 {
        return dec!(100);
    }

    let periods_per_year = n / duration_years;
    let annualized_return = mean * periods_per_year;
    let annualized_dd = downside_deviation * periods_per_year.sqrt();

    Decimal::from_f64_retain(annualized_return / annualized_dd).unwrap_or(Decimal::ZERO)
}
