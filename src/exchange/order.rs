//! Order types for the simulated exchange.

use crate::error::{SimError, SimResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type OrderId = u64;

/// Spot order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl FromStr for Side {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(SimError::InvalidOrderSide(s.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Futures position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl FromStr for Direction {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            _ => Err(SimError::InvalidOrderSide(s.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Execution style of an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
    StopLimit { stop: Decimal, limit: Decimal },
}

/// Which book the order trades on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Market {
    Spot {
        side: Side,
        base: String,
        quote: String,
    },
    Future {
        direction: Direction,
        coin: String,
        quote: String,
        leverage: u8,
    },
}

/// An order as built by strategy code, before the exchange assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub market: Market,
    pub kind: OrderKind,
    /// Quantity in base units
    pub amount: Decimal,
    /// Reference price used for notional checks (limit price for limit orders)
    pub price: Decimal,
}

impl OrderRequest {
    pub fn spot_market(side: Side, base: &str, quote: &str, amount: Decimal, price: Decimal) -> Self {
        Self {
            market: Market::Spot {
                side,
                base: base.to_string(),
                quote: quote.to_string(),
            },
            kind: OrderKind::Market,
            amount,
            price,
        }
    }

    pub fn spot_limit(side: Side, base: &str, quote: &str, amount: Decimal, limit: Decimal) -> Self {
        Self {
            kind: OrderKind::Limit { price: limit },
            ..Self::spot_market(side, base, quote, amount, limit)
        }
    }

    pub fn spot_stop_limit(
        side: Side,
        base: &str,
        quote: &str,
        amount: Decimal,
        stop: Decimal,
        limit: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::StopLimit { stop, limit },
            ..Self::spot_market(side, base, quote, amount, limit)
        }
    }

    pub fn future_market(
        direction: Direction,
        coin: &str,
        quote: &str,
        leverage: u8,
        amount: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            market: Market::Future {
                direction,
                coin: coin.to_string(),
                quote: quote.to_string(),
                leverage,
            },
            kind: OrderKind::Market,
            amount,
            price,
        }
    }

    /// Futures market order sized by quote notional (`amount = quote_amount / price`).
    pub fn future_market_notional(
        direction: Direction,
        coin: &str,
        quote: &str,
        leverage: u8,
        quote_amount: Decimal,
        price: Decimal,
    ) -> Self {
        let amount = if price > Decimal::ZERO {
            quote_amount / price
        } else {
            Decimal::ZERO
        };
        Self::future_market(direction, coin, quote, leverage, amount, price)
    }

    pub fn future_limit(
        direction: Direction,
        coin: &str,
        quote: &str,
        leverage: u8,
        amount: Decimal,
        limit: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::Limit { price: limit },
            ..Self::future_market(direction, coin, quote, leverage, amount, limit)
        }
    }

    pub fn notional(&self) -> Decimal {
        self.amount * self.price
    }

    pub fn instrument(&self) -> String {
        instrument_of(&self.market)
    }
}

/// An order accepted by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub market: Market,
    pub kind: OrderKind,
    pub amount: Decimal,
    /// Reference price at submission, replaced by the fill price once filled
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    /// Filled fraction in [0, 1]
    pub total_filled: Decimal,
    pub fill_price: Option<Decimal>,
}

impl Order {
    pub fn from_request(id: OrderId, request: OrderRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            market: request.market,
            kind: request.kind,
            amount: request.amount,
            price: request.price,
            created_at,
            total_filled: Decimal::ZERO,
            fill_price: None,
        }
    }

    /// Mark the order as completely filled at `price`.
    pub fn fill(&mut self, price: Decimal) {
        self.total_filled = Decimal::ONE;
        self.fill_price = Some(price);
        self.price = price;
    }

    pub fn is_filled(&self) -> bool {
        self.total_filled >= Decimal::ONE
    }

    pub fn is_spot(&self) -> bool {
        matches!(self.market, Market::Spot { .. })
    }

    pub fn instrument(&self) -> String {
        instrument_of(&self.market)
    }

    /// Order book label: BUY/SELL for spot, LONG/SHORT for futures.
    pub fn side_label(&self) -> String {
        match &self.market {
            Market::Spot { side, .. } => side.to_string(),
            Market::Future { direction, .. } => direction.to_string(),
        }
    }
}

fn instrument_of(market: &Market) -> String {
    match market {
        Market::Spot { base, quote, .. } => format!("{}{}", base, quote),
        Market::Future { coin, quote, .. } => format!("{}{}", coin, quote),
    }
}

/// Monotonic order id source owned by one simulation.
#[derive(Debug, Default)]
pub struct OrderIdGenerator {
    next: OrderId,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> OrderId {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parsing() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert_eq!(
            "HOLD".parse::<Side>(),
            Err(SimError::InvalidOrderSide("HOLD".to_string()))
        );
        assert!("BUY".parse::<Direction>().is_err());
        assert_eq!("short".parse::<Direction>().unwrap(), Direction::Short);
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Long.sign(), dec!(1));
        assert_eq!(Direction::Short.sign(), dec!(-1));
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }

    #[test]
    fn test_instrument_and_notional() {
        let spot = OrderRequest::spot_market(Side::Buy, "BTC", "USDT", dec!(0.5), dec!(40000));
        assert_eq!(spot.instrument(), "BTCUSDT");
        assert_eq!(spot.notional(), dec!(20000));

        let fut = OrderRequest::future_market_notional(
            Direction::Short,
            "ETH",
            "USDT",
            5,
            dec!(1000),
            dec!(2000),
        );
        assert_eq!(fut.instrument(), "ETHUSDT");
        assert_eq!(fut.amount, dec!(0.5));
    }

    #[test]
    fn test_limit_builders_keep_market() {
        let req = OrderRequest::spot_stop_limit(Side::Sell, "BTC", "USDT", dec!(1), dec!(95), dec!(94));
        assert_eq!(
            req.kind,
            OrderKind::StopLimit {
                stop: dec!(95),
                limit: dec!(94)
            }
        );
        assert_eq!(req.price, dec!(94));
        assert!(matches!(req.market, Market::Spot { side: Side::Sell, .. }));
    }

    #[test]
    fn test_fill_and_ids() {
        let mut ids = OrderIdGenerator::new();
        let req = OrderRequest::spot_market(Side::Buy, "BTC", "USDT", dec!(1), dec!(100));
        let mut order = Order::from_request(ids.next_id(), req, Utc::now());
        assert_eq!(order.id, 0);
        assert_eq!(ids.next_id(), 1);

        assert!(!order.is_filled());
        order.fill(dec!(101));
        assert!(order.is_filled());
        assert_eq!(order.fill_price, Some(dec!(101)));
        assert_eq!(order.side_label(), "BUY");
    }
}
