//! Accounting: futures positions, portfolio snapshots and order books.

mod portfolio;
mod position;
mod store;

pub use portfolio::{FillRecord, PortfolioLedger};
pub use position::{FuturePosition, LiquidationEvent, MarginDelta, PositionBook};
pub use store::{AssetState, PortfolioSnapshot, SnapshotStore};
