//! Strategy interface and per-type candle routing.
//!
//! A strategy declares, once per type, which handler runs for which
//! interval. The replay clock dispatches every candle through that router.

mod sma_cross;

pub use sma_cross::{SmaCross, SmaCrossMode};

use crate::error::SimResult;
use crate::exchange::ExchangeSimulator;
use crate::market::{Candle, Interval};
use std::collections::BTreeMap;

/// Candle handler. Receives the exchange for the duration of the call only.
pub type Handler<S> = fn(&mut S, &mut ExchangeSimulator, &Candle) -> SimResult<()>;

/// A trading strategy driven by candle closes.
pub trait Strategy: Sized {
    fn name(&self) -> &str;

    /// Interval to handler table for this strategy type.
    fn routes() -> StrategyRouter<Self>;

    /// Called once before replay starts, after warm-up history is loaded.
    fn prepare(&mut self, _exchange: &mut ExchangeSimulator) -> SimResult<()> {
        Ok(())
    }
}

/// Interval to handler table.
#[derive(Debug)]
pub struct StrategyRouter<S> {
    handlers: BTreeMap<Interval, Handler<S>>,
}

impl<S> Default for StrategyRouter<S> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<S> StrategyRouter<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of `intervals`. Later registrations win.
    pub fn on_candle_close(mut self, intervals: &[Interval], handler: Handler<S>) -> Self {
        for interval in intervals {
            self.handlers.insert(*interval, handler);
        }
        self
    }

    pub fn handles(&self, interval: Interval) -> bool {
        self.handlers.contains_key(&interval)
    }

    /// Registered intervals, finest first.
    pub fn intervals(&self) -> Vec<Interval> {
        self.handlers.keys().copied().collect()
    }

    /// Run the handler for the candle's interval, then refresh ledger marks.
    /// Returns false when no handler is registered.
    pub fn dispatch(
        &self,
        strategy: &mut S,
        exchange: &mut ExchangeSimulator,
        candle: &Candle,
    ) -> SimResult<bool> {
        let Some(handler) = self.handlers.get(&candle.interval) else {
            return Ok(false);
        };
        handler(strategy, exchange, candle)?;
        exchange.update_history(candle.close_time, candle)?;
        Ok(true)
    }
}
