//! Portfolio ledger: applies fills to timestamped snapshots and keeps the order books.

use super::position::{LiquidationEvent, MarginDelta, PositionBook};
use super::store::{AssetState, PortfolioSnapshot, SnapshotStore};
use crate::error::{SimError, SimResult};
use crate::exchange::{Market, Order, OrderId, Side};
use crate::market::{base_asset, Candle};
use crate::utils::{fraction_of, safe_div, weighted_average};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// One row of an order book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRecord {
    /// None for close requests and liquidations
    pub order_id: Option<OrderId>,
    pub time: DateTime<Utc>,
    pub instrument: String,
    /// BUY, SELL, LONG, SHORT, CLOSE or LIQUIDATED
    pub side: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub filled: Decimal,
    /// Fraction of the relevant balance the fill consumed
    pub percent: Decimal,
}

/// Exact accounting of spot balances and futures positions over time.
#[derive(Debug, Clone)]
pub struct PortfolioLedger {
    quote_asset: String,
    store: SnapshotStore,
    positions: PositionBook,
    spot_book: Vec<FillRecord>,
    future_book: Vec<FillRecord>,
    fee_rate: Decimal,
    total_fees: Decimal,
    start_worth: Decimal,
}

impl PortfolioLedger {
    /// Create a ledger from initial holdings. The quote asset is always
    /// tracked and priced at 1.
    pub fn new(
        quote_asset: &str,
        mut holdings: BTreeMap<String, AssetState>,
        timestamp: DateTime<Utc>,
        compaction_threshold: usize,
        fee_rate: Decimal,
    ) -> SimResult<Self> {
        if fee_rate < Decimal::ZERO || fee_rate >= Decimal::ONE {
            return Err(SimError::InvalidConfig(format!(
                "fee rate must be within [0, 1), got {}",
                fee_rate
            )));
        }

        let quote = holdings.entry(quote_asset.to_string()).or_default();
        quote.price = Decimal::ONE;
        quote.avg_price = Decimal::ONE;

        let initial = PortfolioSnapshot::new(timestamp, holdings);
        let start_worth = initial.worth();

        Ok(Self {
            quote_asset: quote_asset.to_string(),
            store: SnapshotStore::new(initial, compaction_threshold)?,
            positions: PositionBook::new(),
            spot_book: Vec::new(),
            future_book: Vec::new(),
            fee_rate,
            total_fees: Decimal::ZERO,
            start_worth,
        })
    }

    /// Apply a filled order at `timestamp`.
    pub fn on_fill(&mut self, order: &Order, timestamp: DateTime<Utc>) -> SimResult<FillRecord> {
        let record = match &order.market {
            Market::Spot { side, base, quote } => {
                self.apply_spot(order, *side, base, quote, timestamp)?
            }
            Market::Future { .. } => self.apply_future(order, timestamp)?,
        };

        debug!(
            order_id = order.id,
            instrument = %record.instrument,
            side = %record.side,
            amount = %record.amount,
            price = %record.price,
            "Fill applied"
        );
        Ok(record)
    }

    fn apply_spot(
        &mut self,
        order: &Order,
        side: Side,
        base: &str,
        quote: &str,
        timestamp: DateTime<Utc>,
    ) -> SimResult<FillRecord> {
        let price = order.fill_price.unwrap_or(order.price);
        let qty = order.amount;
        let notional = price * qty;
        let fee = notional * self.fee_rate;

        let snapshot = self.store.advance(timestamp)?;
        let quote_balance = snapshot.asset(quote)?.amount;

        let (percent, cash) = match side {
            Side::Buy => {
                let held = snapshot
                    .assets
                    .entry(base.to_string())
                    .or_insert_with(|| AssetState::new(Decimal::ZERO, price));
                held.avg_price = weighted_average(&[(held.avg_price, held.amount), (price, qty)]);
                held.amount += qty;
                (fraction_of(notional, quote_balance), -notional)
            }
            Side::Sell => {
                let held = snapshot.asset_mut(base)?;
                let percent = fraction_of(qty, held.amount);
                held.amount -= qty;
                (percent, notional)
            }
        };
        snapshot.asset_mut(quote)?.amount += cash - fee;
        self.total_fees += fee;

        let record = FillRecord {
            order_id: Some(order.id),
            time: timestamp,
            instrument: order.instrument(),
            side: side.to_string(),
            amount: qty,
            price,
            filled: order.total_filled,
            percent,
        };
        self.spot_book.push(record.clone());
        Ok(record)
    }

    fn apply_future(&mut self, order: &Order, timestamp: DateTime<Utc>) -> SimResult<FillRecord> {
        let Market::Future {
            direction,
            leverage,
            ..
        } = &order.market
        else {
            return Err(SimError::InvalidOrderSide(order.side_label()));
        };

        let instrument = order.instrument();
        let price = order.fill_price.unwrap_or(order.price);
        let qty = order.amount;
        let fee = price * qty * self.fee_rate;

        let quote_balance = self.store.current().asset(&self.quote_asset)?.amount;
        let delta = self
            .positions
            .apply_order(&instrument, *direction, qty, price, *leverage, timestamp)?;

        let snapshot = self.store.advance(timestamp)?;
        snapshot.marks.insert(instrument.clone(), price);
        Self::apply_delta(snapshot, &self.positions, &self.quote_asset, delta, fee)?;
        self.total_fees += fee;

        let margin = safe_div(price * qty, Decimal::from(*leverage));
        let record = FillRecord {
            order_id: Some(order.id),
            time: timestamp,
            instrument,
            side: direction.to_string(),
            amount: qty,
            price,
            filled: order.total_filled,
            percent: fraction_of(margin, quote_balance),
        };
        self.future_book.push(record.clone());
        Ok(record)
    }

    /// Reduce or close the futures position on `instrument` at `price`.
    pub fn close_future_position(
        &mut self,
        instrument: &str,
        size: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> SimResult<FillRecord> {
        let held = self
            .positions
            .get(instrument)
            .map(|p| p.size)
            .ok_or_else(|| SimError::PositionNotFound(instrument.to_string()))?;
        let fee = price * size * self.fee_rate;
        let delta = self.positions.close(instrument, size, price)?;

        let snapshot = self.store.advance(timestamp)?;
        snapshot.marks.insert(instrument.to_string(), price);
        Self::apply_delta(snapshot, &self.positions, &self.quote_asset, delta, fee)?;
        self.total_fees += fee;

        let record = FillRecord {
            order_id: None,
            time: timestamp,
            instrument: instrument.to_string(),
            side: "CLOSE".to_string(),
            amount: size,
            price,
            filled: Decimal::ONE,
            percent: fraction_of(size, held),
        };
        debug!(%instrument, %size, %price, realized = %delta.realized, "Position close applied");
        self.future_book.push(record.clone());
        Ok(record)
    }

    /// Liquidate the position on `instrument` if the candle range consumed its margin.
    pub fn check_liquidation(
        &mut self,
        instrument: &str,
        low: Decimal,
        high: Decimal,
        timestamp: DateTime<Utc>,
    ) -> SimResult<Option<LiquidationEvent>> {
        let Some((event, delta)) = self
            .positions
            .check_liquidation(instrument, low, high, timestamp)
        else {
            return Ok(None);
        };

        let snapshot = self.store.advance(timestamp)?;
        Self::apply_delta(snapshot, &self.positions, &self.quote_asset, delta, Decimal::ZERO)?;

        self.future_book.push(FillRecord {
            order_id: None,
            time: timestamp,
            instrument: instrument.to_string(),
            side: "LIQUIDATED".to_string(),
            amount: event.size,
            price: event.trigger_price,
            filled: Decimal::ONE,
            percent: Decimal::ONE,
        });
        Ok(Some(event))
    }

    /// Mark the candle's asset at its close and revalue open futures.
    pub fn update_history(&mut self, timestamp: DateTime<Utc>, candle: &Candle) -> SimResult<()> {
        let base = base_asset(&candle.instrument, &self.quote_asset).to_string();

        let snapshot = self.store.advance(timestamp)?;
        snapshot.marks.insert(candle.instrument.clone(), candle.close);
        if base != self.quote_asset {
            if let Some(asset) = snapshot.assets.get_mut(&base) {
                asset.price = candle.close;
            }
        }
        snapshot.future_upnl = self
            .positions
            .unrealized_pnl(|inst| snapshot.marks.get(inst).copied());
        Ok(())
    }

    fn apply_delta(
        snapshot: &mut PortfolioSnapshot,
        positions: &PositionBook,
        quote_asset: &str,
        delta: MarginDelta,
        fee: Decimal,
    ) -> SimResult<()> {
        snapshot.asset_mut(quote_asset)?.amount += delta.cash - fee;
        snapshot.future_margin += delta.margin;
        snapshot.future_upnl = positions.unrealized_pnl(|inst| snapshot.marks.get(inst).copied());
        Ok(())
    }

    // =========================================================================
    // Readers
    // =========================================================================

    pub fn current(&self) -> &PortfolioSnapshot {
        self.store.current()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.store.last_update()
    }

    pub fn amount_of(&self, asset: &str) -> SimResult<Decimal> {
        Ok(self.current().asset(asset)?.amount)
    }

    /// `percent`% of the holdings of `asset`, optionally priced in `as_asset`.
    pub fn amount_in_percent(
        &self,
        asset: &str,
        percent: Decimal,
        as_asset: Option<&str>,
    ) -> SimResult<Decimal> {
        if percent < Decimal::ZERO || percent > dec!(100) {
            return Err(SimError::InvalidPercent(percent));
        }
        let amount = self.amount_of(asset)? * percent / dec!(100);
        match as_asset {
            Some(other) => Ok(safe_div(amount, self.price_of(other)?)),
            None => Ok(amount),
        }
    }

    pub fn avg_price_of(&self, asset: &str) -> SimResult<Decimal> {
        Ok(self.current().asset(asset)?.avg_price)
    }

    pub fn price_of(&self, asset: &str) -> SimResult<Decimal> {
        Ok(self.current().asset(asset)?.price)
    }

    /// Quote value of every spot holding.
    pub fn dollar_status(&self) -> BTreeMap<String, Decimal> {
        self.current()
            .assets
            .iter()
            .map(|(asset, state)| (asset.clone(), state.value()))
            .collect()
    }

    /// Amount of every spot holding.
    pub fn coins_status(&self) -> BTreeMap<String, Decimal> {
        self.current()
            .assets
            .iter()
            .map(|(asset, state)| (asset.clone(), state.amount))
            .collect()
    }

    /// Total worth in quote units, or in units of `asset` when given.
    pub fn portfolio_worth(&self, asset: Option<&str>) -> SimResult<Decimal> {
        let worth = self.current().worth();
        match asset {
            Some(asset) => Ok(safe_div(worth, self.price_of(asset)?)),
            None => Ok(worth),
        }
    }

    pub fn snapshot_at(&self, timestamp: DateTime<Utc>) -> Option<&PortfolioSnapshot> {
        self.store.snapshot_at(timestamp)
    }

    /// All snapshots, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PortfolioSnapshot> {
        self.store.iter()
    }

    pub fn archived(&self) -> &[PortfolioSnapshot] {
        self.store.archived()
    }

    pub fn worth_series(&self) -> Vec<(DateTime<Utc>, Decimal)> {
        self.history().map(|s| (s.timestamp, s.worth())).collect()
    }

    /// Worth of investing `start_worth` by the given fractions at the first
    /// recorded prices and holding.
    pub fn buy_and_hold_series(
        &self,
        allocations: &[(&str, Decimal)],
    ) -> SimResult<Vec<(DateTime<Utc>, Decimal)>> {
        let total: Decimal = allocations.iter().map(|(_, f)| *f).sum();
        if total > Decimal::ONE || allocations.iter().any(|(_, f)| *f < Decimal::ZERO) {
            return Err(SimError::InvalidConfig(format!(
                "benchmark allocations must be non-negative and sum to at most 1, got {}",
                total
            )));
        }

        let Some(first) = self.history().next() else {
            return Ok(Vec::new());
        };
        let mut units = Vec::with_capacity(allocations.len());
        for (asset, fraction) in allocations {
            let price = first.asset(asset)?.price;
            units.push((*asset, safe_div(self.start_worth * fraction, price)));
        }
        let idle = self.start_worth * (Decimal::ONE - total);

        self.history()
            .map(|snapshot| {
                let mut worth = idle;
                for (asset, amount) in &units {
                    worth += amount * snapshot.asset(asset)?.price;
                }
                Ok((snapshot.timestamp, worth))
            })
            .collect()
    }

    pub fn start_worth(&self) -> Decimal {
        self.start_worth
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn spot_book(&self) -> &[FillRecord] {
        &self.spot_book
    }

    pub fn future_book(&self) -> &[FillRecord] {
        &self.future_book
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.positions.realized_pnl()
    }

    pub fn liquidation_count(&self) -> usize {
        self.positions.liquidations().len()
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_fees
    }
}
