//! Two-tier snapshot storage: a small live map and an append-only archive.

use crate::error::{SimError, SimResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Holdings of one asset inside a snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AssetState {
    pub amount: Decimal,
    /// Average cost basis
    pub avg_price: Decimal,
    /// Latest mark price
    pub price: Decimal,
}

impl AssetState {
    pub fn new(amount: Decimal, price: Decimal) -> Self {
        Self {
            amount,
            avg_price: price,
            price,
        }
    }

    pub fn value(&self) -> Decimal {
        self.amount * self.price
    }
}

/// Portfolio state at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub assets: BTreeMap<String, AssetState>,
    /// Latest close per instrument, used to mark futures positions
    pub marks: BTreeMap<String, Decimal>,
    pub future_margin: Decimal,
    pub future_upnl: Decimal,
}

impl PortfolioSnapshot {
    pub fn new(timestamp: DateTime<Utc>, assets: BTreeMap<String, AssetState>) -> Self {
        Self {
            timestamp,
            assets,
            marks: BTreeMap::new(),
            future_margin: Decimal::ZERO,
            future_upnl: Decimal::ZERO,
        }
    }

    /// Spot value plus futures margin and unrealized PnL, in quote units.
    pub fn worth(&self) -> Decimal {
        let spot: Decimal = self.assets.values().map(AssetState::value).sum();
        spot + self.future_margin + self.future_upnl
    }

    pub fn asset(&self, asset: &str) -> SimResult<&AssetState> {
        self.assets
            .get(asset)
            .ok_or_else(|| SimError::UnknownAsset(asset.to_string()))
    }

    pub fn asset_mut(&mut self, asset: &str) -> SimResult<&mut AssetState> {
        self.assets
            .get_mut(asset)
            .ok_or_else(|| SimError::UnknownAsset(asset.to_string()))
    }
}

/// Snapshot history. The head is the only mutable snapshot; once superseded
/// it moves to the live map, and the live map is flushed wholesale into the
/// archive when it reaches the compaction threshold.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    head: PortfolioSnapshot,
    live: BTreeMap<DateTime<Utc>, PortfolioSnapshot>,
    archive: Vec<PortfolioSnapshot>,
    compaction_threshold: usize,
    compactions: usize,
}

impl SnapshotStore {
    pub fn new(initial: PortfolioSnapshot, compaction_threshold: usize) -> SimResult<Self> {
        if compaction_threshold == 0 {
            return Err(SimError::InvalidConfig(
                "compaction threshold must be positive".to_string(),
            ));
        }
        Ok(Self {
            head: initial,
            live: BTreeMap::new(),
            archive: Vec::new(),
            compaction_threshold,
            compactions: 0,
        })
    }

    /// The current snapshot.
    pub fn current(&self) -> &PortfolioSnapshot {
        &self.head
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.head.timestamp
    }

    /// Mutable snapshot for `timestamp`. Equal timestamps return the head;
    /// later ones install a copy of the head at `timestamp` first.
    pub fn advance(&mut self, timestamp: DateTime<Utc>) -> SimResult<&mut PortfolioSnapshot> {
        let last = self.head.timestamp;
        if timestamp < last {
            return Err(SimError::NonMonotonicTimestamp {
                got: timestamp,
                last,
            });
        }

        if timestamp > last {
            let mut next = self.head.clone();
            next.timestamp = timestamp;
            let previous = std::mem::replace(&mut self.head, next);
            self.live.insert(previous.timestamp, previous);

            // Head counts toward the live population
            if self.live.len() + 1 > self.compaction_threshold {
                self.compact();
            }
        }

        Ok(&mut self.head)
    }

    /// Snapshot recorded at exactly `timestamp`: head, then live, then archive.
    pub fn snapshot_at(&self, timestamp: DateTime<Utc>) -> Option<&PortfolioSnapshot> {
        if self.head.timestamp == timestamp {
            return Some(&self.head);
        }
        if let Some(snapshot) = self.live.get(&timestamp) {
            return Some(snapshot);
        }
        self.archive
            .binary_search_by(|s| s.timestamp.cmp(&timestamp))
            .ok()
            .map(|idx| &self.archive[idx])
    }

    /// Every snapshot in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &PortfolioSnapshot> {
        self.archive
            .iter()
            .chain(self.live.values())
            .chain(std::iter::once(&self.head))
    }

    /// Snapshots held, including the head. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.archive.len() + self.live.len() + 1
    }

    pub fn live_len(&self) -> usize {
        self.live.len() + 1
    }

    pub fn archived(&self) -> &[PortfolioSnapshot] {
        &self.archive
    }

    pub fn compactions(&self) -> usize {
        self.compactions
    }

    fn compact(&mut self) {
        let moved = self.live.len();
        let live = std::mem::take(&mut self.live);
        self.archive.extend(live.into_values());
        self.compactions += 1;
        debug!(moved, archived = self.archive.len(), "Compacted snapshot history");
    }
}
