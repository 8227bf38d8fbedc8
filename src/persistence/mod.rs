//! SQLite persistence for completed backtest runs.
//!
//! Each run stores:
//! - Headline metrics (plus the full metrics as JSON)
//! - Order book records
//! - The equity curve
//! - Every portfolio snapshot, live and archived

use crate::backtest::BacktestResult;
use crate::ledger::FillRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Headline figures of a stored run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub id: i64,
    pub strategy: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_return_pct: Decimal,
    pub benchmark_return_pct: Decimal,
    pub max_drawdown: Decimal,
    pub sharpe_ratio: Decimal,
    pub fills: u64,
    pub liquidations: u64,
    pub created_at: DateTime<Utc>,
}

/// SQLite-based store of backtest runs.
pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    /// Open the database, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Run store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                total_return_pct TEXT NOT NULL,
                benchmark_return_pct TEXT NOT NULL,
                max_drawdown TEXT NOT NULL,
                sharpe_ratio TEXT NOT NULL,
                fills INTEGER NOT NULL,
                liquidations INTEGER NOT NULL,
                metrics_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                time TEXT NOT NULL,
                order_id INTEGER,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                amount TEXT NOT NULL,
                price TEXT NOT NULL,
                filled TEXT NOT NULL,
                percent TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_run ON fills(run_id);

            CREATE TABLE IF NOT EXISTS equity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                balance TEXT NOT NULL,
                margin TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                total_equity TEXT NOT NULL,
                drawdown TEXT NOT NULL,
                position_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_run ON equity(run_id);

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                worth TEXT NOT NULL,
                future_margin TEXT NOT NULL,
                future_upnl TEXT NOT NULL,
                assets_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_run ON snapshots(run_id);

            PRAGMA foreign_keys = ON;
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Store a completed run. Returns its id.
    pub fn save_run(&self, result: &BacktestResult) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let metrics = &result.metrics;

        tx.execute(
            r#"
            INSERT INTO runs (strategy, start_time, end_time, total_return_pct, benchmark_return_pct,
                              max_drawdown, sharpe_ratio, fills, liquidations, metrics_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                result.strategy,
                result.start_time.to_rfc3339(),
                result.end_time.to_rfc3339(),
                metrics.total_return_pct.to_string(),
                metrics.benchmark_return_pct.to_string(),
                metrics.max_drawdown.to_string(),
                metrics.sharpe_ratio.to_string(),
                metrics.total_fills,
                metrics.liquidations,
                serde_json::to_string(metrics).context("Failed to encode metrics")?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO fills (run_id, time, order_id, instrument, side, amount, price, filled, percent)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for fill in &result.fills {
                stmt.execute(params![
                    run_id,
                    fill.time.to_rfc3339(),
                    fill.order_id,
                    fill.instrument,
                    fill.side,
                    fill.amount.to_string(),
                    fill.price.to_string(),
                    fill.filled.to_string(),
                    fill.percent.to_string(),
                ])?;
            }

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO equity (run_id, timestamp, balance, margin, unrealized_pnl,
                                    total_equity, drawdown, position_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for point in &result.equity_curve {
                stmt.execute(params![
                    run_id,
                    point.timestamp.to_rfc3339(),
                    point.balance.to_string(),
                    point.margin.to_string(),
                    point.unrealized_pnl.to_string(),
                    point.total_equity.to_string(),
                    point.drawdown.to_string(),
                    point.position_count,
                ])?;
            }

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO snapshots (run_id, timestamp, worth, future_margin, future_upnl, assets_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for snapshot in &result.snapshots {
                stmt.execute(params![
                    run_id,
                    snapshot.timestamp.to_rfc3339(),
                    snapshot.worth().to_string(),
                    snapshot.future_margin.to_string(),
                    snapshot.future_upnl.to_string(),
                    serde_json::to_string(&snapshot.assets).context("Failed to encode snapshot")?,
                ])?;
            }
        }

        tx.commit()?;

        info!(
            run_id,
            strategy = %result.strategy,
            fills = result.fills.len(),
            equity_points = result.equity_curve.len(),
            snapshots = result.snapshots.len(),
            "Run saved to database"
        );
        Ok(run_id)
    }

    /// All stored runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, strategy, start_time, end_time, total_return_pct, benchmark_return_pct,
                   max_drawdown, sharpe_ratio, fills, liquidations, created_at
            FROM runs
            ORDER BY id DESC
            "#,
        )?;

        let runs = stmt
            .query_map([], run_summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// A single run's headline figures.
    pub fn get_run(&self, run_id: i64) -> Result<Option<RunSummary>> {
        let run = self
            .conn
            .query_row(
                r#"
                SELECT id, strategy, start_time, end_time, total_return_pct, benchmark_return_pct,
                       max_drawdown, sharpe_ratio, fills, liquidations, created_at
                FROM runs WHERE id = ?1
                "#,
                [run_id],
                run_summary_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Order book records of a run, in insertion order.
    pub fn load_fills(&self, run_id: i64) -> Result<Vec<FillRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT time, order_id, instrument, side, amount, price, filled, percent
            FROM fills WHERE run_id = ?1
            ORDER BY id
            "#,
        )?;

        let fills = stmt
            .query_map([run_id], |row| {
                Ok(FillRecord {
                    time: time_column(row, 0)?,
                    order_id: row.get(1)?,
                    instrument: row.get(2)?,
                    side: row.get(3)?,
                    amount: decimal_column(row, 4)?,
                    price: decimal_column(row, 5)?,
                    filled: decimal_column(row, 6)?,
                    percent: decimal_column(row, 7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fills)
    }

    /// (timestamp, total equity) pairs of a run.
    pub fn load_equity(&self, run_id: i64) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, total_equity
            FROM equity WHERE run_id = ?1
            ORDER BY id
            "#,
        )?;

        let points = stmt
            .query_map([run_id], |row| Ok((time_column(row, 0)?, decimal_column(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// (timestamp, worth) pairs of every stored snapshot of a run.
    pub fn load_worth_series(&self, run_id: i64) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, worth
            FROM snapshots WHERE run_id = ?1
            ORDER BY id
            "#,
        )?;

        let points = stmt
            .query_map([run_id], |row| Ok((time_column(row, 0)?, decimal_column(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// Remove a run and everything recorded for it.
    pub fn delete_run(&self, run_id: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        for table in ["fills", "equity", "snapshots"] {
            tx.execute(&format!("DELETE FROM {} WHERE run_id = ?1", table), [run_id])?;
        }
        let deleted = tx.execute("DELETE FROM runs WHERE id = ?1", [run_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}

fn run_summary_from_row(row: &Row<'_>) -> rusqlite::Result<RunSummary> {
    Ok(RunSummary {
        id: row.get(0)?,
        strategy: row.get(1)?,
        start_time: time_column(row, 2)?,
        end_time: time_column(row, 3)?,
        total_return_pct: decimal_column(row, 4)?,
        benchmark_return_pct: decimal_column(row, 5)?,
        max_drawdown: decimal_column(row, 6)?,
        sharpe_ratio: decimal_column(row, 7)?,
        fills: row.get(8)?,
        liquidations: row.get(9)?,
        created_at: time_column(row, 10)?,
    })
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestMetrics, EquityPoint};
    use crate::ledger::{AssetState, PortfolioSnapshot};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn result() -> BacktestResult {
        let mut metrics = BacktestMetrics::empty();
        metrics.total_return_pct = dec!(3.5);
        metrics.benchmark_return_pct = dec!(1.25);
        metrics.total_fills = 2;
        metrics.liquidations = 1;

        let mut assets = BTreeMap::new();
        assets.insert("USDT".to_string(), AssetState::new(dec!(1000), Decimal::ONE));
        assets.insert("BTC".to_string(), AssetState::new(dec!(0.5), dec!(100)));

        BacktestResult {
            strategy: "sma_cross".to_string(),
            metrics,
            equity_curve: vec![
                EquityPoint::new(ts(1), dec!(1000), dec!(0), dec!(0), 0, dec!(1000)),
                EquityPoint::new(ts(2), dec!(990), dec!(40), dec!(5.5), 1, dec!(1000)),
            ],
            fills: vec![
                FillRecord {
                    order_id: Some(0),
                    time: ts(1),
                    instrument: "BTCUSDT".to_string(),
                    side: "BUY".to_string(),
                    amount: dec!(0.5),
                    price: dec!(100),
                    filled: dec!(0.5),
                    percent: dec!(0.05),
                },
                FillRecord {
                    order_id: None,
                    time: ts(2),
                    instrument: "ETHUSDT".to_string(),
                    side: "LIQUIDATED".to_string(),
                    amount: dec!(2),
                    price: dec!(9.5),
                    filled: dec!(2),
                    percent: dec!(1),
                },
            ],
            liquidations: Vec::new(),
            benchmark: Vec::new(),
            snapshots: vec![PortfolioSnapshot::new(ts(1), assets)],
            start_time: ts(1),
            end_time: ts(2),
            candles_replayed: 2,
            ticks: 2,
        }
    }

    #[test]
    fn test_save_and_load_run() {
        let store = RunStore::new(":memory:").unwrap();
        let run_id = store.save_run(&result()).unwrap();

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.strategy, "sma_cross");
        assert_eq!(run.total_return_pct, dec!(3.5));
        assert_eq!(run.benchmark_return_pct, dec!(1.25));
        assert_eq!(run.fills, 2);
        assert_eq!(run.liquidations, 1);
        assert_eq!(run.start_time, ts(1));

        let fills = store.load_fills(run_id).unwrap();
        assert_eq!(fills, result().fills);

        let equity = store.load_equity(run_id).unwrap();
        assert_eq!(equity, vec![(ts(1), dec!(1000)), (ts(2), dec!(1035.5))]);

        let worth = store.load_worth_series(run_id).unwrap();
        assert_eq!(worth, vec![(ts(1), dec!(1050))]);
    }

    #[test]
    fn test_list_and_delete_runs() {
        let store = RunStore::new(":memory:").unwrap();
        let first = store.save_run(&result()).unwrap();
        let second = store.save_run(&result()).unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);

        assert!(store.delete_run(first).unwrap());
        assert!(!store.delete_run(first).unwrap());
        assert!(store.get_run(first).unwrap().is_none());
        assert!(store.load_fills(first).unwrap().is_empty());
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let run_id = RunStore::new(&path).unwrap().save_run(&result()).unwrap();
        let reopened = RunStore::new(&path).unwrap();

        assert!(reopened.get_run(run_id).unwrap().is_some());
        assert_eq!(reopened.load_fills(run_id).unwrap().len(), 2);
    }
}
