//! Exchange capability trait.
//!
//! Strategies and the replay clock talk to an exchange through these
//! operations; the simulator is the only implementation in this crate.

use super::order::{Order, OrderId, OrderRequest};
use super::simulator::{SettlementReport, Tick};
use crate::error::SimResult;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Order entry and settlement for one trading venue.
pub trait Exchange {
    /// Accept an order for later settlement. `Ok(None)` means it was dropped
    /// without being queued.
    fn submit_order(&mut self, request: OrderRequest) -> SimResult<Option<OrderId>>;

    /// Queue a reduction of the futures position on `instrument`.
    fn close_position(&mut self, instrument: &str, size: Decimal);

    /// Apply queued work at one tick.
    fn settle(&mut self, tick: &Tick) -> SimResult<SettlementReport>;

    /// Cancel every open order and return them.
    fn cancel_all(&mut self, timestamp: DateTime<Utc>) -> Vec<Order>;

    fn open_orders(&self) -> Vec<&Order>;
}
