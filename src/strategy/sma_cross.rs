//! Moving-average crossover strategy used by the `backtest` command.

use super::{Strategy, StrategyRouter};
use crate::error::SimResult;
use crate::exchange::{Direction, ExchangeSimulator, OrderRequest, Side};
use crate::market::{Candle, Interval};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

/// Trading venue for the crossover signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmaCrossMode {
    /// Buy the base asset on an up-cross, sell it all on a down-cross
    Spot,
    /// Hold a long above the slow average and a short below it
    Futures { leverage: u8 },
}

/// Fast/slow simple moving average crossover on one instrument.
#[derive(Debug, Clone)]
pub struct SmaCross {
    base: String,
    quote: String,
    interval: Interval,
    fast: usize,
    slow: usize,
    /// Percent of the quote balance committed per entry
    allocation: Decimal,
    mode: SmaCrossMode,
    last_signal: Option<Direction>,
}

impl SmaCross {
    pub fn new(
        base: &str,
        quote: &str,
        interval: Interval,
        fast: usize,
        slow: usize,
        mode: SmaCrossMode,
    ) -> Self {
        Self {
            base: base.to_string(),
            quote: quote.to_string(),
            interval,
            fast: fast.max(1),
            slow: slow.max(fast.max(1) + 1),
            allocation: dec!(50),
            mode,
            last_signal: None,
        }
    }

    pub fn with_allocation(mut self, percent: Decimal) -> Self {
        self.allocation = percent;
        self
    }

    pub fn instrument(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    fn on_candle(&mut self, exchange: &mut ExchangeSimulator, candle: &Candle) -> SimResult<()> {
        if candle.interval != self.interval || !candle.is_close {
            return Ok(());
        }
        let instrument = self.instrument();
        if candle.instrument != instrument {
            return Ok(());
        }

        let Ok(closes) = exchange.close(&instrument, self.interval, self.slow) else {
            // Not enough history yet
            return Ok(());
        };
        let signal = crossover(&closes, self.fast);
        if Some(signal) == self.last_signal {
            return Ok(());
        }
        let first_signal = self.last_signal.is_none();
        self.last_signal = Some(signal);

        debug!(%instrument, signal = %signal, close = %candle.close, "Crossover signal");

        match self.mode {
            SmaCrossMode::Spot => self.trade_spot(exchange, signal, candle.close),
            SmaCrossMode::Futures { leverage } => {
                self.trade_futures(exchange, signal, candle.close, leverage, first_signal)
            }
        }
    }

    fn trade_spot(
        &self,
        exchange: &mut ExchangeSimulator,
        signal: Direction,
        price: Decimal,
    ) -> SimResult<()> {
        let ledger = exchange.ledger();
        let request = match signal {
            Direction::Long => {
                let budget = ledger.amount_in_percent(&self.quote, self.allocation, None)?;
                if price <= Decimal::ZERO {
                    return Ok(());
                }
                OrderRequest::spot_market(Side::Buy, &self.base, &self.quote, budget / price, price)
            }
            Direction::Short => {
                let held = ledger.amount_of(&self.base).unwrap_or(Decimal::ZERO);
                if held <= Decimal::ZERO {
                    return Ok(());
                }
                OrderRequest::spot_market(Side::Sell, &self.base, &self.quote, held, price)
            }
        };
        exchange.submit(request)?;
        Ok(())
    }

    fn trade_futures(
        &self,
        exchange: &mut ExchangeSimulator,
        signal: Direction,
        price: Decimal,
        leverage: u8,
        first_signal: bool,
    ) -> SimResult<()> {
        let instrument = self.instrument();
        let budget = exchange
            .ledger()
            .amount_in_percent(&self.quote, self.allocation, None)?;
        let notional = budget * Decimal::from(leverage);

        // An opposing order larger than the open size flips the position
        let held = exchange
            .ledger()
            .positions()
            .get(&instrument)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        let request = OrderRequest::future_market_notional(
            signal,
            &self.base,
            &self.quote,
            leverage,
            notional,
            price,
        );
        let request = if first_signal || held == Decimal::ZERO {
            request
        } else {
            OrderRequest {
                amount: request.amount + held,
                ..request
            }
        };
        exchange.submit(request)?;
        Ok(())
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn routes() -> StrategyRouter<Self> {
        StrategyRouter::new().on_candle_close(&Interval::ALL, SmaCross::on_candle)
    }
}

/// Long when the fast average of the window tail is above the window average.
fn crossover(closes: &[Decimal], fast: usize) -> Direction {
    let slow_avg = mean(closes);
    let tail = &closes[closes.len().saturating_sub(fast)..];
    if mean(tail) > slow_avg {
        Direction::Long
    } else {
        Direction::Short
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
}
