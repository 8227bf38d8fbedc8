//! Simulated exchange: order model, settlement and the exchange trait.
//!
//! Orders are never filled on submission. They wait in a FIFO task queue
//! until the replay clock settles the next tick.

mod order;
mod simulator;
mod traits;

pub use order::{
    Direction, Market, Order, OrderId, OrderIdGenerator, OrderKind, OrderRequest, Side,
};
pub use simulator::{
    ExchangeSimulator, LimitFillPolicy, SettlementReport, Task, Tick, TickQuote,
};
pub use traits::Exchange;
