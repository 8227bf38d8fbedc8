//! Simulated exchange: holds open orders and deferred tasks, settles them
//! against tick prices and drives the portfolio ledger.

use super::order::{Direction, Market, Order, OrderId, OrderIdGenerator, OrderKind, OrderRequest, Side};
use super::traits::Exchange;
use crate::config::SimulationConfig;
use crate::error::SimResult;
use crate::ledger::{AssetState, FillRecord, LiquidationEvent, PortfolioLedger};
use crate::market::{Candle, Field, Interval, MarketHistory};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Settlement rule for limit and stop-limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitFillPolicy {
    /// Fill at the tick close like a market order
    #[default]
    AsMarket,
    /// Fill only once the tick close crosses the limit; stops trigger first
    OnCross,
}

/// Prices of one instrument at a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickQuote {
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
}

/// One settlement timestamp with a quote per instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub quotes: BTreeMap<String, TickQuote>,
}

impl Tick {
    /// Build from the candles sharing `timestamp`, in replay order. The first
    /// closed candle of each instrument provides its quote; unclosed candles
    /// never price a tick.
    pub fn from_candles(timestamp: DateTime<Utc>, candles: &[Candle]) -> Self {
        let mut quotes = BTreeMap::new();
        for candle in candles.iter().filter(|c| c.is_close) {
            quotes
                .entry(candle.instrument.clone())
                .or_insert(TickQuote {
                    close: candle.close,
                    high: candle.high,
                    low: candle.low,
                });
        }
        Self { timestamp, quotes }
    }
}

/// Work deferred until the next settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Fill(OrderId),
    ClosePosition { instrument: String, size: Decimal },
}

/// Outcome of one settlement pass.
#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub fills: Vec<FillRecord>,
    pub liquidations: Vec<LiquidationEvent>,
    /// Tasks left for a later tick
    pub carried: usize,
}

/// Single-owner exchange simulation for one backtest.
#[derive(Debug)]
pub struct ExchangeSimulator {
    ledger: PortfolioLedger,
    history: MarketHistory,
    ids: OrderIdGenerator,
    open_orders: BTreeMap<OrderId, Order>,
    tasks: VecDeque<Task>,
    min_notional: Decimal,
    limit_fill_policy: LimitFillPolicy,
    now: DateTime<Utc>,
}

impl ExchangeSimulator {
    /// Create a simulator whose ledger starts with `holdings` at `start`.
    pub fn new(
        config: &SimulationConfig,
        holdings: BTreeMap<String, AssetState>,
        start: DateTime<Utc>,
    ) -> SimResult<Self> {
        let ledger = PortfolioLedger::new(
            &config.quote_asset,
            holdings,
            start,
            config.compaction_threshold,
            config.fee_rate,
        )?;

        info!(
            quote_asset = %config.quote_asset,
            start_worth = %ledger.start_worth(),
            memory_length = config.memory_length,
            policy = ?config.limit_fill_policy,
            "Exchange simulator initialized"
        );

        Ok(Self {
            ledger,
            history: MarketHistory::new(config.memory_length),
            ids: OrderIdGenerator::new(),
            open_orders: BTreeMap::new(),
            tasks: VecDeque::new(),
            min_notional: config.min_notional,
            limit_fill_policy: config.limit_fill_policy,
            now: start,
        })
    }

    /// Current simulation time.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn set_time(&mut self, timestamp: DateTime<Utc>) {
        self.now = timestamp;
    }

    /// Accept an order for the next settlement. Orders below the minimum
    /// notional are logged and dropped.
    pub fn submit(&mut self, request: OrderRequest) -> SimResult<Option<OrderId>> {
        let notional = request.notional();
        if notional < self.min_notional {
            warn!(
                instrument = %request.instrument(),
                %notional,
                min_notional = %self.min_notional,
                "Order below minimum notional rejected"
            );
            return Ok(None);
        }

        let id = self.ids.next_id();
        let order = Order::from_request(id, request, self.now);
        debug!(
            order_id = id,
            instrument = %order.instrument(),
            side = %order.side_label(),
            amount = %order.amount,
            price = %order.price,
            kind = ?order.kind,
            "Order accepted"
        );

        self.open_orders.insert(id, order);
        self.tasks.push_back(Task::Fill(id));
        Ok(Some(id))
    }

    /// Request a futures position reduction at the next settlement.
    pub fn close_position(&mut self, instrument: &str, size: Decimal) {
        debug!(%instrument, %size, "Close position queued");
        self.tasks.push_back(Task::ClosePosition {
            instrument: instrument.to_string(),
            size,
        });
    }

    /// Settle one tick: liquidations first, then deferred tasks in FIFO order.
    pub fn settle(&mut self, tick: &Tick) -> SimResult<SettlementReport> {
        self.now = tick.timestamp;
        let mut report = SettlementReport::default();

        for instrument in self.ledger.positions().instruments() {
            let Some(quote) = tick.quotes.get(&instrument) else {
                continue;
            };
            if let Some(event) =
                self.ledger
                    .check_liquidation(&instrument, quote.low, quote.high, tick.timestamp)?
            {
                report.liquidations.push(event);
            }
        }

        let liquidated: BTreeMap<String, Direction> = report
            .liquidations
            .iter()
            .map(|event| (event.instrument.clone(), event.direction))
            .collect();

        let pending = std::mem::take(&mut self.tasks);
        for task in pending {
            match task {
                Task::Fill(id) => {
                    if let Some(order) = self.open_orders.get(&id) {
                        if reduces_liquidated(order, &liquidated) {
                            warn!(
                                order_id = id,
                                instrument = %order.instrument(),
                                side = %order.side_label(),
                                amount = %order.amount,
                                "Order against liquidated position dropped"
                            );
                            self.open_orders.remove(&id);
                            continue;
                        }
                    }

                    // Canceled orders leave stale tasks behind
                    let Some(order) = self.open_orders.get_mut(&id) else {
                        continue;
                    };
                    let Some(quote) = tick.quotes.get(&order.instrument()) else {
                        self.tasks.push_back(Task::Fill(id));
                        continue;
                    };
                    match fill_price(order, quote.close, self.limit_fill_policy) {
                        Some(price) => {
                            order.fill(price);
                            let record = self.ledger.on_fill(order, tick.timestamp)?;
                            report.fills.push(record);
                        }
                        None => self.tasks.push_back(Task::Fill(id)),
                    }
                }
                Task::ClosePosition { instrument, size } => {
                    if liquidated.contains_key(&instrument) {
                        warn!(%instrument, %size, "Close of liquidated position dropped");
                        continue;
                    }
                    let Some(quote) = tick.quotes.get(&instrument) else {
                        self.tasks.push_back(Task::ClosePosition { instrument, size });
                        continue;
                    };
                    let record = self.ledger.close_future_position(
                        &instrument,
                        size,
                        quote.close,
                        tick.timestamp,
                    )?;
                    report.fills.push(record);
                }
            }
        }

        self.open_orders.retain(|_, order| !order.is_filled());
        report.carried = self.tasks.len();

        if !report.fills.is_empty() || !report.liquidations.is_empty() {
            debug!(
                timestamp = %tick.timestamp,
                fills = report.fills.len(),
                liquidations = report.liquidations.len(),
                carried = report.carried,
                "Tick settled"
            );
        }
        Ok(report)
    }

    /// Cancel every open order. The ledger is not touched.
    pub fn cancel_all(&mut self, timestamp: DateTime<Utc>) -> Vec<Order> {
        let canceled: Vec<Order> = std::mem::take(&mut self.open_orders).into_values().collect();
        self.tasks.retain(|task| !matches!(task, Task::Fill(_)));

        for order in &canceled {
            warn!(
                order_id = order.id,
                instrument = %order.instrument(),
                side = %order.side_label(),
                amount = %order.amount,
                %timestamp,
                "Order canceled"
            );
        }
        canceled
    }

    /// Cancel a single open order.
    pub fn cancel(&mut self, id: OrderId) -> Option<Order> {
        let order = self.open_orders.remove(&id)?;
        self.tasks.retain(|task| task != &Task::Fill(id));
        warn!(order_id = id, instrument = %order.instrument(), "Order canceled");
        Some(order)
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.open_orders.values()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    // =========================================================================
    // History Access
    // =========================================================================

    /// Seed warm-up history for one series.
    pub fn add_history(
        &mut self,
        instrument: &str,
        interval: Interval,
        candles: &[Candle],
    ) -> SimResult<()> {
        self.history.add_history(instrument, interval, candles)
    }

    pub fn record_candle(&mut self, candle: &Candle) -> SimResult<()> {
        self.history.record(candle)
    }

    /// The `k` most recent values of `field`, oldest first.
    pub fn window(
        &self,
        field: Field,
        instrument: &str,
        interval: Interval,
        k: usize,
    ) -> SimResult<Vec<Decimal>> {
        self.history.window(field, instrument, interval, k)
    }

    pub fn open(&self, instrument: &str, interval: Interval, k: usize) -> SimResult<Vec<Decimal>> {
        self.window(Field::Open, instrument, interval, k)
    }

    pub fn high(&self, instrument: &str, interval: Interval, k: usize) -> SimResult<Vec<Decimal>> {
        self.window(Field::High, instrument, interval, k)
    }

    pub fn low(&self, instrument: &str, interval: Interval, k: usize) -> SimResult<Vec<Decimal>> {
        self.window(Field::Low, instrument, interval, k)
    }

    pub fn close(&self, instrument: &str, interval: Interval, k: usize) -> SimResult<Vec<Decimal>> {
        self.window(Field::Close, instrument, interval, k)
    }

    pub fn history(&self) -> &MarketHistory {
        &self.history
    }

    // =========================================================================
    // Ledger Access
    // =========================================================================

    pub fn ledger(&self) -> &PortfolioLedger {
        &self.ledger
    }

    /// Refresh marks and futures uPnL from a dispatched candle.
    pub fn update_history(&mut self, timestamp: DateTime<Utc>, candle: &Candle) -> SimResult<()> {
        self.ledger.update_history(timestamp, candle)
    }

    pub fn into_ledger(self) -> PortfolioLedger {
        self.ledger
    }
}

impl Exchange for ExchangeSimulator {
    fn submit_order(&mut self, request: OrderRequest) -> SimResult<Option<OrderId>> {
        self.submit(request)
    }

    fn close_position(&mut self, instrument: &str, size: Decimal) {
        ExchangeSimulator::close_position(self, instrument, size)
    }

    fn settle(&mut self, tick: &Tick) -> SimResult<SettlementReport> {
        ExchangeSimulator::settle(self, tick)
    }

    fn cancel_all(&mut self, timestamp: DateTime<Utc>) -> Vec<Order> {
        ExchangeSimulator::cancel_all(self, timestamp)
    }

    fn open_orders(&self) -> Vec<&Order> {
        self.open_orders.values().collect()
    }
}

fn is_buy(market: &Market) -> bool {
    match market {
        Market::Spot { side, .. } => *side == Side::Buy,
        Market::Future { direction, .. } => direction.sign() > Decimal::ZERO,
    }
}

/// Whether `order` opposes a position liquidated earlier in the same tick.
fn reduces_liquidated(order: &Order, liquidated: &BTreeMap<String, Direction>) -> bool {
    match &order.market {
        Market::Future { direction, .. } => liquidated
            .get(&order.instrument())
            .is_some_and(|held| held != direction),
        Market::Spot { .. } => false,
    }
}

/// Price an order fills at this tick, if it fills at all. Under `OnCross` a
/// touched stop turns the order into a plain limit order.
fn fill_price(order: &mut Order, close: Decimal, policy: LimitFillPolicy) -> Option<Decimal> {
    if policy == LimitFillPolicy::AsMarket {
        return Some(close);
    }

    let buy = is_buy(&order.market);
    if let OrderKind::StopLimit { stop, limit } = order.kind {
        let triggered = if buy { close >= stop } else { close <= stop };
        if !triggered {
            return None;
        }
        debug!(order_id = order.id, %stop, %close, "Stop triggered");
        order.kind = OrderKind::Limit { price: limit };
    }

    match order.kind {
        OrderKind::Market => Some(close),
        OrderKind::Limit { price } => {
            let crossed = if buy { close <= price } else { close >= price };
            crossed.then_some(close)
        }
        OrderKind::StopLimit { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::exchange::Direction;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn config(policy: LimitFillPolicy) -> SimulationConfig {
        SimulationConfig {
            quote_asset: "QUOTE".to_string(),
            limit_fill_policy: policy,
            memory_length: 3,
            ..SimulationConfig::default()
        }
    }

    fn simulator(policy: LimitFillPolicy) -> ExchangeSimulator {
        let mut holdings = BTreeMap::new();
        holdings.insert("QUOTE".to_string(), AssetState::new(dec!(10000), Decimal::ONE));
        ExchangeSimulator::new(&config(policy), holdings, ts(0)).unwrap()
    }

    fn tick(minute: i64, quotes: &[(&str, Decimal, Decimal, Decimal)]) -> Tick {
        Tick {
            timestamp: ts(minute),
            quotes: quotes
                .iter()
                .map(|(inst, close, high, low)| {
                    (
                        inst.to_string(),
                        TickQuote {
                            close: *close,
                            high: *high,
                            low: *low,
                        },
                    )
                })
                .collect(),
        }
    }

    fn flat(minute: i64, instrument: &str, price: Decimal) -> Tick {
        tick(minute, &[(instrument, price, price, price)])
    }

    fn candle(instrument: &str, interval: Interval, close: Decimal, is_close: bool) -> Candle {
        Candle {
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: Decimal::ONE,
            close_time: ts(1),
            is_close,
            instrument: instrument.to_string(),
            interval,
        }
    }

    fn buy(amount: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest::spot_market(Side::Buy, "BTC", "QUOTE", amount, price)
    }

    // =========================================================================
    // Submission Tests
    // =========================================================================

    #[test]
    fn test_submit_queues_without_filling() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        let id = sim.submit(buy(dec!(1), dec!(100))).unwrap();

        assert_eq!(id, Some(0));
        assert_eq!(sim.open_orders().count(), 1);
        assert_eq!(sim.pending_tasks(), 1);
        assert!(sim.ledger().amount_of("BTC").is_err());
    }

    #[test]
    fn test_below_min_notional_dropped() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        let id = sim.submit(buy(dec!(0.1), dec!(100))).unwrap();

        assert_eq!(id, None);
        assert_eq!(sim.open_orders().count(), 0);
        assert_eq!(sim.pending_tasks(), 0);

        // Dropped orders do not consume ids
        assert_eq!(sim.submit(buy(dec!(1), dec!(100))).unwrap(), Some(0));
    }

    // =========================================================================
    // Settlement Tests
    // =========================================================================

    #[test]
    fn test_market_order_fills_at_tick_close() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(buy(dec!(1), dec!(100))).unwrap();

        let report = sim.settle(&flat(1, "BTCQUOTE", dec!(105))).unwrap();

        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.fills[0].price, dec!(105));
        assert_eq!(sim.ledger().amount_of("BTC").unwrap(), dec!(1));
        assert_eq!(sim.ledger().amount_of("QUOTE").unwrap(), dec!(9895));
        assert_eq!(sim.open_orders().count(), 0);
        assert_eq!(sim.pending_tasks(), 0);
    }

    #[test]
    fn test_fills_in_submission_order() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(buy(dec!(2), dec!(100))).unwrap();
        sim.submit(OrderRequest::spot_market(
            Side::Sell,
            "BTC",
            "QUOTE",
            dec!(1),
            dec!(100),
        ))
        .unwrap();

        let report = sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();
        let sides: Vec<_> = report.fills.iter().map(|f| f.side.as_str()).collect();
        assert_eq!(sides, vec!["BUY", "SELL"]);
        assert_eq!(sim.ledger().amount_of("BTC").unwrap(), dec!(1));
    }

    #[test]
    fn test_task_without_price_carries_over() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(buy(dec!(1), dec!(100))).unwrap();

        let report = sim.settle(&flat(1, "ETHQUOTE", dec!(50))).unwrap();
        assert!(report.fills.is_empty());
        assert_eq!(report.carried, 1);
        assert_eq!(sim.open_orders().count(), 1);

        let report = sim.settle(&flat(2, "BTCQUOTE", dec!(101))).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.carried, 0);
    }

    #[test]
    fn test_unclosed_candles_never_price_a_tick() {
        let candles = vec![
            candle("BTCQUOTE", Interval::Minute1, dec!(99), false),
            candle("BTCQUOTE", Interval::Minute5, dec!(101), true),
            candle("ETHQUOTE", Interval::Minute1, dec!(10), false),
        ];
        let tick = Tick::from_candles(ts(1), &candles);

        assert_eq!(tick.quotes.len(), 1);
        assert_eq!(tick.quotes["BTCQUOTE"].close, dec!(101));

        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::spot_market(Side::Buy, "ETH", "QUOTE", dec!(3), dec!(10)))
            .unwrap();
        let report = sim.settle(&tick).unwrap();
        assert!(report.fills.is_empty());
        assert_eq!(report.carried, 1);
    }

    #[test]
    fn test_finest_closed_candle_prices_tick() {
        let candles = vec![
            candle("BTCQUOTE", Interval::Minute1, dec!(100), true),
            candle("BTCQUOTE", Interval::Hour1, dec!(120), true),
        ];
        let tick = Tick::from_candles(ts(1), &candles);
        assert_eq!(tick.quotes["BTCQUOTE"].close, dec!(100));
    }

    #[test]
    fn test_close_position_task() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::future_market(
            Direction::Long,
            "BTC",
            "QUOTE",
            10,
            dec!(2),
            dec!(100),
        ))
        .unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        sim.close_position("BTCQUOTE", dec!(2));
        let report = sim.settle(&flat(2, "BTCQUOTE", dec!(110))).unwrap();

        assert_eq!(report.fills[0].side, "CLOSE");
        assert!(sim.ledger().positions().is_empty());
        assert_eq!(sim.ledger().amount_of("QUOTE").unwrap(), dec!(10020));
    }

    #[test]
    fn test_ledger_violation_aborts_settlement() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.close_position("BTCQUOTE", dec!(1));

        assert_eq!(
            sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap_err(),
            SimError::PositionNotFound("BTCQUOTE".to_string())
        );
    }

    #[test]
    fn test_liquidation_checked_before_fills() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::future_market(
            Direction::Long,
            "BTC",
            "QUOTE",
            10,
            dec!(1),
            dec!(100),
        ))
        .unwrap();

        // Opening tick has a low far below the liquidation price
        let report = sim
            .settle(&tick(1, &[("BTCQUOTE", dec!(100), dec!(100), dec!(50))]))
            .unwrap();
        assert!(report.liquidations.is_empty());
        assert_eq!(sim.ledger().positions().len(), 1);

        let report = sim
            .settle(&tick(2, &[("BTCQUOTE", dec!(95), dec!(101), dec!(90))]))
            .unwrap();
        assert_eq!(report.liquidations.len(), 1);
        assert_eq!(report.liquidations[0].loss, dec!(-10));
        assert!(sim.ledger().positions().is_empty());
        assert_eq!(sim.ledger().portfolio_worth(None).unwrap(), dec!(9990));
    }

    #[test]
    fn test_close_after_liquidation_is_dropped() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::future_market(
            Direction::Long,
            "BTC",
            "QUOTE",
            10,
            dec!(1),
            dec!(100),
        ))
        .unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        sim.close_position("BTCQUOTE", dec!(1));
        let report = sim
            .settle(&tick(2, &[("BTCQUOTE", dec!(92), dec!(100), dec!(89))]))
            .unwrap();

        assert_eq!(report.liquidations.len(), 1);
        assert!(report.fills.is_empty());
        assert_eq!(sim.pending_tasks(), 0);
        assert!(sim.ledger().positions().is_empty());
        assert_eq!(sim.ledger().portfolio_worth(None).unwrap(), dec!(9990));
    }

    #[test]
    fn test_opposing_order_after_liquidation_does_not_flip() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::future_market(
            Direction::Long,
            "BTC",
            "QUOTE",
            10,
            dec!(1),
            dec!(100),
        ))
        .unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        sim.submit(OrderRequest::future_market(
            Direction::Short,
            "BTC",
            "QUOTE",
            10,
            dec!(1),
            dec!(92),
        ))
        .unwrap();
        let report = sim
            .settle(&tick(2, &[("BTCQUOTE", dec!(92), dec!(100), dec!(89))]))
            .unwrap();

        assert_eq!(report.liquidations.len(), 1);
        assert!(report.fills.is_empty());
        assert!(sim.ledger().positions().is_empty());
        assert_eq!(sim.open_orders().count(), 0);
        assert_eq!(sim.pending_tasks(), 0);
    }

    #[test]
    fn test_same_direction_order_after_liquidation_reopens() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        let long = || {
            OrderRequest::future_market(Direction::Long, "BTC", "QUOTE", 10, dec!(1), dec!(100))
        };
        sim.submit(long()).unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        sim.submit(long()).unwrap();
        let report = sim
            .settle(&tick(2, &[("BTCQUOTE", dec!(92), dec!(100), dec!(89))]))
            .unwrap();

        assert_eq!(report.liquidations.len(), 1);
        assert_eq!(report.fills.len(), 1);
        assert_eq!(sim.ledger().positions().len(), 1);
    }

    #[test]
    fn test_short_liquidates_on_high() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::future_market(
            Direction::Short,
            "BTC",
            "QUOTE",
            10,
            dec!(1),
            dec!(100),
        ))
        .unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        let report = sim
            .settle(&tick(2, &[("BTCQUOTE", dec!(100), dec!(109), dec!(60))]))
            .unwrap();
        assert!(report.liquidations.is_empty());

        let report = sim
            .settle(&tick(3, &[("BTCQUOTE", dec!(100), dec!(110), dec!(100))]))
            .unwrap();
        assert_eq!(report.liquidations.len(), 1);
    }

    // =========================================================================
    // Limit Policy Tests
    // =========================================================================

    #[test]
    fn test_limit_as_market_fills_immediately() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(OrderRequest::spot_limit(Side::Buy, "BTC", "QUOTE", dec!(1), dec!(90)))
            .unwrap();

        let report = sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();
        assert_eq!(report.fills[0].price, dec!(100));
    }

    #[test]
    fn test_limit_on_cross_waits_for_price() {
        let mut sim = simulator(LimitFillPolicy::OnCross);
        sim.submit(OrderRequest::spot_limit(Side::Buy, "BTC", "QUOTE", dec!(1), dec!(90)))
            .unwrap();

        let report = sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();
        assert!(report.fills.is_empty());
        assert_eq!(sim.open_orders().count(), 1);

        let report = sim.settle(&flat(2, "BTCQUOTE", dec!(89))).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.fills[0].price, dec!(89));
        assert_eq!(sim.open_orders().count(), 0);
    }

    #[test]
    fn test_stop_limit_on_cross_triggers_then_limits() {
        let mut sim = simulator(LimitFillPolicy::OnCross);
        sim.submit(buy(dec!(10), dec!(100))).unwrap();
        sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();

        sim.submit(OrderRequest::spot_stop_limit(
            Side::Sell,
            "BTC",
            "QUOTE",
            dec!(5),
            dec!(95),
            dec!(94),
        ))
        .unwrap();

        // Above the stop: nothing
        assert!(sim.settle(&flat(2, "BTCQUOTE", dec!(97))).unwrap().fills.is_empty());
        // Stop touched but below the sell limit
        assert!(sim.settle(&flat(3, "BTCQUOTE", dec!(93))).unwrap().fills.is_empty());
        let order = sim.open_orders().next().unwrap();
        assert_eq!(order.kind, OrderKind::Limit { price: dec!(94) });

        let report = sim.settle(&flat(4, "BTCQUOTE", dec!(94.5))).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(sim.ledger().amount_of("BTC").unwrap(), dec!(5));
    }

    // =========================================================================
    // Cancellation Tests
    // =========================================================================

    #[test]
    fn test_cancel_all_leaves_ledger_unchanged() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        sim.submit(buy(dec!(1), dec!(100))).unwrap();
        sim.submit(buy(dec!(2), dec!(100))).unwrap();
        sim.close_position("BTCQUOTE", dec!(1));
        let before = sim.ledger().current().clone();

        let canceled = sim.cancel_all(ts(0));

        assert_eq!(canceled.len(), 2);
        assert_eq!(sim.open_orders().count(), 0);
        assert_eq!(sim.pending_tasks(), 1);
        assert_eq!(sim.ledger().current(), &before);
        assert!(sim.ledger().spot_book().is_empty());
    }

    #[test]
    fn test_cancel_single_order() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        let first = sim.submit(buy(dec!(1), dec!(100))).unwrap().unwrap();
        sim.submit(buy(dec!(2), dec!(100))).unwrap();

        assert!(sim.cancel(first).is_some());
        assert!(sim.cancel(first).is_none());

        let report = sim.settle(&flat(1, "BTCQUOTE", dec!(100))).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.fills[0].amount, dec!(2));
    }

    // =========================================================================
    // History Tests
    // =========================================================================

    #[test]
    fn test_history_helpers() {
        let mut sim = simulator(LimitFillPolicy::AsMarket);
        let seed: Vec<Candle> = [10, 11, 12]
            .iter()
            .map(|c| candle("BTCQUOTE", Interval::Minute1, Decimal::from(*c), true))
            .collect();
        sim.add_history("BTCQUOTE", Interval::Minute1, &seed).unwrap();
        sim.record_candle(&candle("BTCQUOTE", Interval::Minute1, dec!(13), true))
            .unwrap();

        assert_eq!(
            sim.close("BTCQUOTE", Interval::Minute1, 3).unwrap(),
            vec![dec!(11), dec!(12), dec!(13)]
        );
        assert_eq!(
            sim.high("BTCQUOTE", Interval::Minute1, 1).unwrap(),
            vec![dec!(14)]
        );
        assert!(matches!(
            sim.low("BTCQUOTE", Interval::Minute1, 4),
            Err(SimError::Range { .. })
        ));
    }

    #[test]
    fn test_usable_through_exchange_trait() {
        fn place<E: Exchange>(exchange: &mut E) -> SimResult<Option<OrderId>> {
            exchange.submit_order(OrderRequest::spot_market(
                Side::Buy,
                "BTC",
                "QUOTE",
                dec!(1),
                dec!(100),
            ))
        }

        let mut sim = simulator(LimitFillPolicy::AsMarket);
        assert_eq!(place(&mut sim).unwrap(), Some(0));
        assert_eq!(Exchange::open_orders(&sim).len(), 1);
    }
}
