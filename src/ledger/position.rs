//! Futures position lifecycle: open, average in, reduce, flip, liquidate.

use crate::error::{SimError, SimResult};
use crate::exchange::Direction;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// An open leveraged futures position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuturePosition {
    pub id: u64,
    pub instrument: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub direction: Direction,
    pub leverage: u8,
    /// size * entry_price / leverage
    pub margin: Decimal,
    /// entry_price - entry_price / leverage * direction
    pub liquidation_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl FuturePosition {
    pub fn open(
        id: u64,
        instrument: &str,
        size: Decimal,
        entry_price: Decimal,
        direction: Direction,
        leverage: u8,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let mut position = Self {
            id,
            instrument: instrument.to_string(),
            entry_price,
            size,
            direction,
            leverage,
            margin: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
            opened_at,
        };
        position.reprice();
        position
    }

    /// Profit or loss of the whole position at `mark_price`.
    pub fn pnl(&self, mark_price: Decimal) -> Decimal {
        (mark_price - self.entry_price) * self.size * self.direction.sign()
    }

    /// Worst price within a candle for this direction (low for long, high for short).
    pub fn adverse_price(&self, low: Decimal, high: Decimal) -> Decimal {
        match self.direction {
            Direction::Long => low,
            Direction::Short => high,
        }
    }

    /// True when the adverse extreme of the candle wipes out the margin.
    pub fn is_liquidated(&self, low: Decimal, high: Decimal) -> bool {
        self.pnl(self.adverse_price(low, high)) <= -self.margin
    }

    /// Average in at `price`; returns the additional margin.
    fn increase(&mut self, amount: Decimal, price: Decimal) -> Decimal {
        let margin_before = self.margin;
        let new_size = self.size + amount;
        self.entry_price = (self.entry_price * self.size + price * amount) / new_size;
        self.size = new_size;
        self.reprice();
        self.margin - margin_before
    }

    /// Close `amount` at `mark_price`; returns (realized pnl, released margin).
    fn reduce(&mut self, amount: Decimal, mark_price: Decimal) -> (Decimal, Decimal) {
        let released = if self.size > Decimal::ZERO {
            self.margin * amount / self.size
        } else {
            Decimal::ZERO
        };
        let pnl = (mark_price - self.entry_price) * amount * self.direction.sign();
        self.size -= amount;
        self.margin -= released;
        (pnl, released)
    }

    fn reprice(&mut self) {
        let leverage = Decimal::from(self.leverage);
        self.margin = self.size * self.entry_price / leverage;
        self.liquidation_price =
            self.entry_price - self.entry_price / leverage * self.direction.sign();
    }
}

/// Cash and margin movements produced by a position change.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MarginDelta {
    /// Change in quote cash
    pub cash: Decimal,
    /// Change in the futures margin balance
    pub margin: Decimal,
    /// Realized profit or loss
    pub realized: Decimal,
}

impl MarginDelta {
    fn merge(self, other: MarginDelta) -> MarginDelta {
        MarginDelta {
            cash: self.cash + other.cash,
            margin: self.margin + other.margin,
            realized: self.realized + other.realized,
        }
    }
}

/// A forced closure caused by adverse price movement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidationEvent {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub trigger_price: Decimal,
    /// Always the negated margin of the position
    pub loss: Decimal,
}

/// One open futures position per instrument.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    positions: BTreeMap<String, FuturePosition>,
    next_id: u64,
    realized_pnl: Decimal,
    liquidations: Vec<LiquidationEvent>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a filled futures order to the position of `instrument`.
    pub fn apply_order(
        &mut self,
        instrument: &str,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
        leverage: u8,
        timestamp: DateTime<Utc>,
    ) -> SimResult<MarginDelta> {
        if leverage == 0 {
            return Err(SimError::InvalidConfig(format!(
                "leverage must be at least 1 for {}",
                instrument
            )));
        }

        let Some(position) = self.positions.get_mut(instrument) else {
            return Ok(self.open(instrument, amount, price, direction, leverage, timestamp));
        };

        if position.leverage != leverage {
            return Err(SimError::LeverageMismatch {
                instrument: instrument.to_string(),
                current: position.leverage,
                requested: leverage,
            });
        }

        if position.direction == direction {
            let added = position.increase(amount, price);
            debug!(
                %instrument,
                size = %position.size,
                entry_price = %position.entry_price,
                "Position increased"
            );
            return Ok(MarginDelta {
                cash: -added,
                margin: added,
                realized: Decimal::ZERO,
            });
        }

        if amount < position.size {
            return self.close(instrument, amount, price);
        }

        // Opposing amount covers the whole position: close, then flip with the rest
        let held = position.size;
        let closed = self.close(instrument, held, price)?;
        let remainder = amount - held;
        if remainder > Decimal::ZERO {
            let opened = self.open(instrument, remainder, price, direction, leverage, timestamp);
            debug!(%instrument, %remainder, direction = %direction, "Position flipped");
            return Ok(closed.merge(opened));
        }
        Ok(closed)
    }

    /// Reduce a position by `size` at `mark_price`.
    pub fn close(
        &mut self,
        instrument: &str,
        size: Decimal,
        mark_price: Decimal,
    ) -> SimResult<MarginDelta> {
        let position = self
            .positions
            .get_mut(instrument)
            .ok_or_else(|| SimError::PositionNotFound(instrument.to_string()))?;

        if size > position.size {
            return Err(SimError::OverClose {
                instrument: instrument.to_string(),
                requested: size,
                held: position.size,
            });
        }

        let (pnl, released) = position.reduce(size, mark_price);
        if position.size == Decimal::ZERO {
            self.positions.remove(instrument);
        }
        self.realized_pnl += pnl;

        debug!(%instrument, %size, %pnl, released_margin = %released, "Position reduced");

        Ok(MarginDelta {
            cash: pnl + released,
            margin: -released,
            realized: pnl,
        })
    }

    /// Liquidate `instrument` if the candle's adverse extreme consumed its margin.
    pub fn check_liquidation(
        &mut self,
        instrument: &str,
        low: Decimal,
        high: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Option<(LiquidationEvent, MarginDelta)> {
        let position = self.positions.get(instrument)?;
        if !position.is_liquidated(low, high) {
            return None;
        }

        let position = self.positions.remove(instrument)?;
        let event = LiquidationEvent {
            timestamp,
            instrument: position.instrument.clone(),
            direction: position.direction,
            size: position.size,
            entry_price: position.entry_price,
            trigger_price: position.adverse_price(low, high),
            loss: -position.margin,
        };
        self.realized_pnl -= position.margin;

        warn!(
            %instrument,
            direction = %position.direction,
            size = %position.size,
            entry_price = %position.entry_price,
            trigger_price = %event.trigger_price,
            margin_lost = %position.margin,
            "Position liquidated"
        );

        self.liquidations.push(event.clone());
        Some((
            event,
            MarginDelta {
                cash: Decimal::ZERO,
                margin: -position.margin,
                realized: -position.margin,
            },
        ))
    }

    /// Sum of open-position PnL at the supplied marks; unknown marks count as zero.
    pub fn unrealized_pnl<F>(&self, mark: F) -> Decimal
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        self.positions
            .values()
            .filter_map(|p| mark(&p.instrument).map(|m| p.pnl(m)))
            .sum()
    }

    pub fn total_margin(&self) -> Decimal {
        self.positions.values().map(|p| p.margin).sum()
    }

    pub fn get(&self, instrument: &str) -> Option<&FuturePosition> {
        self.positions.get(instrument)
    }

    pub fn positions(&self) -> impl Iterator<Item = &FuturePosition> {
        self.positions.values()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn liquidations(&self) -> &[LiquidationEvent] {
        &self.liquidations
    }

    fn open(
        &mut self,
        instrument: &str,
        amount: Decimal,
        price: Decimal,
        direction: Direction,
        leverage: u8,
        timestamp: DateTime<Utc>,
    ) -> MarginDelta {
        let id = self.next_id;
        self.next_id += 1;

        let position =
            FuturePosition::open(id, instrument, amount, price, direction, leverage, timestamp);
        let margin = position.margin;

        debug!(
            %instrument,
            direction = %direction,
            size = %amount,
            entry_price = %price,
            leverage,
            %margin,
            liquidation_price = %position.liquidation_price,
            "Position opened"
        );

        self.positions.insert(instrument.to_string(), position);
        MarginDelta {
            cash: -margin,
            margin,
            realized: Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    // =========================================================================
    // FuturePosition Math Tests
    // =========================================================================

    #[test]
    fn test_long_margin_and_liquidation_price() {
        let pos = FuturePosition::open(0, "BTCQUOTE", dec!(1), dec!(100), Direction::Long, 10, t0());
        assert_eq!(pos.margin, dec!(10));
        assert_eq!(pos.liquidation_price, dec!(90));
        assert_eq!(pos.pnl(dec!(110)), dec!(10));
        assert_eq!(pos.pnl(dec!(91)), dec!(-9));
    }

    #[test]
    fn test_short_pnl_and_liquidation_price() {
        let pos = FuturePosition::open(0, "BTCQUOTE", dec!(2), dec!(100), Direction::Short, 5, t0());
        assert_eq!(pos.margin, dec!(40));
        assert_eq!(pos.liquidation_price, dec!(120));
        // (E - mark) * S
        assert_eq!(pos.pnl(dec!(90)), dec!(20));
        assert_eq!(pos.pnl(dec!(110)), dec!(-20));
    }

    #[test]
    fn test_liquidation_uses_adverse_extreme() {
        let long = FuturePosition::open(0, "X", dec!(1), dec!(100), Direction::Long, 10, t0());
        assert!(!long.is_liquidated(dec!(91), dec!(150)));
        assert!(long.is_liquidated(dec!(90), dec!(100)));

        let short = FuturePosition::open(1, "X", dec!(1), dec!(100), Direction::Short, 10, t0());
        // A deep low never hurts a short
        assert!(!short.is_liquidated(dec!(50), dec!(109)));
        assert!(short.is_liquidated(dec!(95), dec!(110)));
    }

    // =========================================================================
    // PositionBook Transition Tests
    // =========================================================================

    #[test]
    fn test_open_debits_margin() {
        let mut book = PositionBook::new();
        let delta = book
            .apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();

        assert_eq!(delta.cash, dec!(-10));
        assert_eq!(delta.margin, dec!(10));
        assert_eq!(book.total_margin(), dec!(10));
    }

    #[test]
    fn test_same_direction_averages_entry() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();
        let delta = book
            .apply_order("BTCQUOTE", Direction::Long, dec!(3), dec!(200), 10, t0())
            .unwrap();

        let pos = book.get("BTCQUOTE").unwrap();
        assert_eq!(pos.size, dec!(4));
        assert_eq!(pos.entry_price, dec!(175));
        assert_eq!(pos.margin, dec!(70));
        assert_eq!(delta.margin, dec!(60));
        assert_eq!(delta.cash, dec!(-60));
    }

    #[test]
    fn test_partial_close_realizes_proportionally() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(2), dec!(100), 10, t0())
            .unwrap();
        let delta = book
            .apply_order("BTCQUOTE", Direction::Short, dec!(0.5), dec!(120), 10, t0())
            .unwrap();

        // pnl = (120 - 100) * 0.5, released = 20 * 0.5 / 2
        assert_eq!(delta.realized, dec!(10));
        assert_eq!(delta.margin, dec!(-5));
        assert_eq!(delta.cash, dec!(15));

        let pos = book.get("BTCQUOTE").unwrap();
        assert_eq!(pos.size, dec!(1.5));
        assert_eq!(pos.direction, Direction::Long);
        assert_eq!(pos.margin, dec!(15));
    }

    #[test]
    fn test_flip_closes_then_opens_remainder() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();
        let delta = book
            .apply_order("BTCQUOTE", Direction::Short, dec!(3), dec!(110), 10, t0())
            .unwrap();

        // Close: pnl 10, release 10 -> cash +20, margin -10
        // Open short 2 @ 110: margin 22 -> cash -22, margin +22
        assert_eq!(delta.realized, dec!(10));
        assert_eq!(delta.cash, dec!(-2));
        assert_eq!(delta.margin, dec!(12));

        let pos = book.get("BTCQUOTE").unwrap();
        assert_eq!(pos.direction, Direction::Short);
        assert_eq!(pos.size, dec!(2));
        assert_eq!(pos.entry_price, dec!(110));
        assert_eq!(pos.id, 1);
    }

    #[test]
    fn test_exact_opposite_amount_closes_fully() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Short, dec!(1), dec!(100), 2, t0())
            .unwrap();
        let delta = book
            .apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(80), 2, t0())
            .unwrap();

        assert_eq!(delta.realized, dec!(20));
        assert_eq!(delta.cash, dec!(70));
        assert!(book.is_empty());
        assert_eq!(book.realized_pnl(), dec!(20));
    }

    #[test]
    fn test_leverage_change_rejected() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();
        let err = book
            .apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 20, t0())
            .unwrap_err();

        assert_eq!(
            err,
            SimError::LeverageMismatch {
                instrument: "BTCQUOTE".to_string(),
                current: 10,
                requested: 20
            }
        );
        assert_eq!(book.get("BTCQUOTE").unwrap().size, dec!(1));
    }

    #[test]
    fn test_zero_leverage_rejected() {
        let mut book = PositionBook::new();
        assert!(book
            .apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 0, t0())
            .is_err());
    }

    #[test]
    fn test_over_close_rejected() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();

        assert!(matches!(
            book.close("BTCQUOTE", dec!(1.5), dec!(100)),
            Err(SimError::OverClose { .. })
        ));
        assert_eq!(
            book.close("ETHQUOTE", dec!(1), dec!(100)),
            Err(SimError::PositionNotFound("ETHQUOTE".to_string()))
        );
    }

    #[test]
    fn test_liquidation_drops_position_and_loses_margin() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();

        assert!(book
            .check_liquidation("BTCQUOTE", dec!(91), dec!(101), t0())
            .is_none());

        let (event, delta) = book
            .check_liquidation("BTCQUOTE", dec!(90), dec!(101), t0())
            .unwrap();

        assert_eq!(event.loss, dec!(-10));
        assert_eq!(event.trigger_price, dec!(90));
        assert_eq!(delta.margin, dec!(-10));
        assert_eq!(delta.cash, Decimal::ZERO);
        assert!(book.get("BTCQUOTE").is_none());
        assert_eq!(book.liquidations().len(), 1);
        assert_eq!(book.realized_pnl(), dec!(-10));
    }

    #[test]
    fn test_unrealized_pnl_sums_marked_positions() {
        let mut book = PositionBook::new();
        book.apply_order("BTCQUOTE", Direction::Long, dec!(1), dec!(100), 10, t0())
            .unwrap();
        book.apply_order("ETHQUOTE", Direction::Short, dec!(2), dec!(50), 5, t0())
            .unwrap();

        let upnl = book.unrealized_pnl(|inst| match inst {
            "BTCQUOTE" => Some(dec!(105)),
            "ETHQUOTE" => Some(dec!(45)),
            _ => None,
        });
        assert_eq!(upnl, dec!(15));

        let partial = book.unrealized_pnl(|inst| (inst == "BTCQUOTE").then_some(dec!(90)));
        assert_eq!(partial, dec!(-10));
    }
}
