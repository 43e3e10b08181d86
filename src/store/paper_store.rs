// =============================================================================
// Paper-trading archive — runs, trades, skips, orderflow metrics
// =============================================================================
//
// Append-only sandbox history keyed by run_id. A run row is created open at
// start and patched on finish; every open/close produces a trade row and
// every rejected entry a skip row. Incomplete backtest runs (no finish
// timestamp) are purged before a new backtest so aggregates never mix with
// aborted replays. The database is the single source of truth for completed
// ranges.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::types::RunSource;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sandbox_runs (
    run_id           TEXT PRIMARY KEY,
    symbol           TEXT NOT NULL,
    date_from        TEXT,
    date_to          TEXT,
    started_at_sec   INTEGER NOT NULL,
    finished_at_sec  INTEGER,
    source           TEXT NOT NULL,
    initial_balance  REAL NOT NULL,
    final_equity     REAL,
    total_pnl        REAL,
    total_commission REAL,
    trades_count     INTEGER
);
CREATE INDEX IF NOT EXISTS ix_sandbox_runs_started ON sandbox_runs (started_at_sec);
CREATE INDEX IF NOT EXISTS ix_sandbox_runs_symbol ON sandbox_runs (symbol);

CREATE TABLE IF NOT EXISTS sandbox_trades (
    run_id            TEXT NOT NULL,
    ts_utc            TEXT,
    ts_unix           INTEGER,
    action            TEXT,
    side              TEXT,
    price             REAL,
    size              REAL,
    notional_usd      REAL,
    commission_usd    REAL,
    realized_pnl_usd  REAL,
    signal_direction  TEXT,
    signal_confidence REAL,
    reason            TEXT,
    leverage          REAL,
    exit_reason       TEXT,
    entry_type        TEXT,
    FOREIGN KEY (run_id) REFERENCES sandbox_runs(run_id)
);
CREATE INDEX IF NOT EXISTS ix_sandbox_trades_run ON sandbox_trades (run_id);
CREATE INDEX IF NOT EXISTS ix_sandbox_trades_ts ON sandbox_trades (ts_unix);

CREATE TABLE IF NOT EXISTS sandbox_skips (
    run_id      TEXT NOT NULL,
    ts_utc      TEXT,
    ts_unix     INTEGER,
    direction   TEXT,
    confidence  REAL,
    skip_reason TEXT,
    FOREIGN KEY (run_id) REFERENCES sandbox_runs(run_id)
);
CREATE INDEX IF NOT EXISTS ix_sandbox_skips_run ON sandbox_skips (run_id);

CREATE TABLE IF NOT EXISTS orderflow_metrics (
    symbol          TEXT NOT NULL,
    ts              INTEGER NOT NULL,
    imbalance_ratio REAL,
    bid_volume      REAL,
    ask_volume      REAL,
    delta           REAL,
    buy_volume      REAL,
    sell_volume     REAL,
    delta_ratio     REAL,
    volume_per_sec  REAL,
    trades_count    INTEGER,
    is_volume_spike INTEGER,
    last_sweep_side TEXT,
    last_sweep_time INTEGER,
    PRIMARY KEY (symbol, ts)
);
CREATE INDEX IF NOT EXISTS ix_orderflow_symbol_ts ON orderflow_metrics (symbol, ts);
"#;

/// One sandbox trade row (CSV columns + run_id).
#[derive(Debug, Clone)]
pub struct TradeRow {
    pub ts_utc: String,
    pub ts_unix: i64,
    pub action: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
    pub notional_usd: f64,
    pub commission_usd: f64,
    pub realized_pnl_usd: Option<f64>,
    pub signal_direction: String,
    pub signal_confidence: f64,
    pub reason: String,
    pub leverage: f64,
    pub exit_reason: String,
    pub entry_type: String,
}

/// One rejected-entry diagnostic row.
#[derive(Debug, Clone)]
pub struct SkipRow {
    pub ts_utc: String,
    pub ts_unix: i64,
    pub direction: String,
    pub confidence: f64,
    pub skip_reason: String,
}

/// One sandbox run row.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub symbol: String,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub started_at_sec: i64,
    pub finished_at_sec: Option<i64>,
    pub source: String,
    pub initial_balance: f64,
    pub final_equity: Option<f64>,
    pub total_pnl: Option<f64>,
    pub total_commission: Option<f64>,
    pub trades_count: Option<i64>,
}

/// Per-tick order-flow metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct OrderflowMetricsRow {
    pub imbalance_ratio: Option<f64>,
    pub bid_volume: Option<f64>,
    pub ask_volume: Option<f64>,
    pub delta: Option<f64>,
    pub buy_volume: Option<f64>,
    pub sell_volume: Option<f64>,
    pub delta_ratio: Option<f64>,
    pub volume_per_sec: Option<f64>,
    pub trades_count: Option<i64>,
    pub is_volume_spike: bool,
    pub last_sweep_side: Option<String>,
    pub last_sweep_time: Option<i64>,
}

pub struct PaperStore {
    conn: Mutex<Connection>,
}

impl PaperStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open paper store at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("failed to apply paper schema")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("failed to set busy_timeout")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory paper store")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an open run row.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_run(
        &self,
        run_id: &str,
        symbol: &str,
        source: RunSource,
        initial_balance: f64,
        date_from: Option<&str>,
        date_to: Option<&str>,
        started_at_sec: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sandbox_runs
             (run_id, symbol, date_from, date_to, started_at_sec, source, initial_balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                symbol,
                date_from,
                date_to,
                started_at_sec,
                source.as_str(),
                initial_balance
            ],
        )
        .context("failed to insert sandbox run")?;
        Ok(())
    }

    /// Patch the run on completion.
    pub fn finish_run(
        &self,
        run_id: &str,
        finished_at_sec: i64,
        final_equity: f64,
        total_pnl: f64,
        total_commission: f64,
        trades_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sandbox_runs
             SET finished_at_sec = ?1, final_equity = ?2, total_pnl = ?3,
                 total_commission = ?4, trades_count = ?5
             WHERE run_id = ?6",
            params![
                finished_at_sec,
                final_equity,
                total_pnl,
                total_commission,
                trades_count,
                run_id
            ],
        )
        .context("failed to finish sandbox run")?;
        Ok(())
    }

    /// Delete backtest runs that never finished, together with their trades
    /// and skips. Returns the number of runs removed.
    pub fn purge_unfinished_backtests(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM sandbox_trades WHERE run_id IN
             (SELECT run_id FROM sandbox_runs WHERE source = 'backtest' AND finished_at_sec IS NULL)",
            [],
        )?;
        tx.execute(
            "DELETE FROM sandbox_skips WHERE run_id IN
             (SELECT run_id FROM sandbox_runs WHERE source = 'backtest' AND finished_at_sec IS NULL)",
            [],
        )?;
        let purged = tx.execute(
            "DELETE FROM sandbox_runs WHERE source = 'backtest' AND finished_at_sec IS NULL",
            [],
        )?;
        tx.commit()?;
        if purged > 0 {
            info!(purged, "purged unfinished backtest runs");
        }
        Ok(purged)
    }

    pub fn insert_trade(&self, run_id: &str, row: &TradeRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sandbox_trades
             (run_id, ts_utc, ts_unix, action, side, price, size, notional_usd, commission_usd,
              realized_pnl_usd, signal_direction, signal_confidence, reason, leverage,
              exit_reason, entry_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                run_id,
                row.ts_utc,
                row.ts_unix,
                row.action,
                row.side,
                row.price,
                row.size,
                row.notional_usd,
                row.commission_usd,
                row.realized_pnl_usd,
                row.signal_direction,
                row.signal_confidence,
                row.reason,
                row.leverage,
                row.exit_reason,
                row.entry_type,
            ],
        )
        .context("failed to insert sandbox trade")?;
        Ok(())
    }

    pub fn insert_skip(&self, run_id: &str, row: &SkipRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sandbox_skips (run_id, ts_utc, ts_unix, direction, confidence, skip_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                row.ts_utc,
                row.ts_unix,
                row.direction,
                row.confidence,
                row.skip_reason,
            ],
        )
        .context("failed to insert sandbox skip")?;
        Ok(())
    }

    /// INSERT OR REPLACE keyed on (symbol, ts): one metrics row per second.
    pub fn insert_orderflow_metrics(
        &self,
        symbol: &str,
        ts_sec: i64,
        row: &OrderflowMetricsRow,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO orderflow_metrics
             (symbol, ts, imbalance_ratio, bid_volume, ask_volume, delta, buy_volume, sell_volume,
              delta_ratio, volume_per_sec, trades_count, is_volume_spike, last_sweep_side,
              last_sweep_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                symbol,
                ts_sec,
                row.imbalance_ratio,
                row.bid_volume,
                row.ask_volume,
                row.delta,
                row.buy_volume,
                row.sell_volume,
                row.delta_ratio,
                row.volume_per_sec,
                row.trades_count,
                row.is_volume_spike as i64,
                row.last_sweep_side,
                row.last_sweep_time,
            ],
        )
        .context("failed to insert orderflow metrics")?;
        Ok(())
    }

    /// Trades for one run, ascending by time.
    pub fn trades_for_run(&self, run_id: &str) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts_utc, ts_unix, action, side, price, size, notional_usd, commission_usd,
                    realized_pnl_usd, signal_direction, signal_confidence, reason, leverage,
                    exit_reason, entry_type
             FROM sandbox_trades WHERE run_id = ?1 ORDER BY ts_unix ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(TradeRow {
                    ts_utc: row.get(0)?,
                    ts_unix: row.get(1)?,
                    action: row.get(2)?,
                    side: row.get(3)?,
                    price: row.get(4)?,
                    size: row.get(5)?,
                    notional_usd: row.get(6)?,
                    commission_usd: row.get(7)?,
                    realized_pnl_usd: row.get(8)?,
                    signal_direction: row.get(9)?,
                    signal_confidence: row.get(10)?,
                    reason: row.get(11)?,
                    leverage: row.get(12)?,
                    exit_reason: row.get(13)?,
                    entry_type: row.get(14)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT run_id, symbol, date_from, date_to, started_at_sec, finished_at_sec,
                        source, initial_balance, final_equity, total_pnl, total_commission,
                        trades_count
                 FROM sandbox_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        symbol: row.get(1)?,
                        date_from: row.get(2)?,
                        date_to: row.get(3)?,
                        started_at_sec: row.get(4)?,
                        finished_at_sec: row.get(5)?,
                        source: row.get(6)?,
                        initial_balance: row.get(7)?,
                        final_equity: row.get(8)?,
                        total_pnl: row.get(9)?,
                        total_commission: row.get(10)?,
                        trades_count: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Recent runs, newest first, optionally filtered by source/symbol.
    pub fn list_runs(
        &self,
        source: Option<RunSource>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunRow>> {
        let conn = self.conn.lock();
        let mut conditions = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(src) = source {
            conditions.push(format!("source = ?{}", args.len() + 1));
            args.push(Box::new(src.as_str().to_string()));
        }
        if let Some(sym) = symbol {
            conditions.push(format!("symbol = ?{}", args.len() + 1));
            args.push(Box::new(sym.to_string()));
        }
        let where_clause = if conditions.is_empty() {
            "1".to_string()
        } else {
            conditions.join(" AND ")
        };
        args.push(Box::new(limit as i64));
        let sql = format!(
            "SELECT run_id, symbol, date_from, date_to, started_at_sec, finished_at_sec, source,
                    initial_balance, final_equity, total_pnl, total_commission, trades_count
             FROM sandbox_runs WHERE {where_clause} ORDER BY started_at_sec DESC LIMIT ?{}",
            args.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(RunRow {
                    run_id: row.get(0)?,
                    symbol: row.get(1)?,
                    date_from: row.get(2)?,
                    date_to: row.get(3)?,
                    started_at_sec: row.get(4)?,
                    finished_at_sec: row.get(5)?,
                    source: row.get(6)?,
                    initial_balance: row.get(7)?,
                    final_equity: row.get(8)?,
                    total_pnl: row.get(9)?,
                    total_commission: row.get(10)?,
                    trades_count: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade_row(ts: i64, action: &str, pnl: Option<f64>) -> TradeRow {
        TradeRow {
            ts_utc: "2026-01-01 00:00:00".into(),
            ts_unix: ts,
            action: action.into(),
            side: "long".into(),
            price: 20_000.0,
            size: 0.01,
            notional_usd: 200.0,
            commission_usd: 0.12,
            realized_pnl_usd: pnl,
            signal_direction: "long".into(),
            signal_confidence: 0.5,
            reason: "test".into(),
            leverage: 2.0,
            exit_reason: String::new(),
            entry_type: "microstructure".into(),
        }
    }

    #[test]
    fn run_lifecycle_open_then_finish() {
        let store = PaperStore::open_in_memory().unwrap();
        store
            .insert_run("r1", "BTCUSDT", RunSource::Live, 100.0, None, None, 1_700_000_000)
            .unwrap();
        let open = store.get_run("r1").unwrap().unwrap();
        assert!(open.finished_at_sec.is_none());

        store
            .finish_run("r1", 1_700_000_600, 109.75, 10.0, 0.25, 2)
            .unwrap();
        let done = store.get_run("r1").unwrap().unwrap();
        assert_eq!(done.finished_at_sec, Some(1_700_000_600));
        assert_eq!(done.trades_count, Some(2));
    }

    #[test]
    fn trades_ascend_by_time() {
        let store = PaperStore::open_in_memory().unwrap();
        store
            .insert_run("r1", "BTCUSDT", RunSource::Backtest, 100.0, None, None, 0)
            .unwrap();
        store.insert_trade("r1", &trade_row(20, "close", Some(10.0))).unwrap();
        store.insert_trade("r1", &trade_row(10, "open", None)).unwrap();

        let rows = store.trades_for_run("r1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "open");
        assert_eq!(rows[1].realized_pnl_usd, Some(10.0));
    }

    #[test]
    fn purge_removes_only_unfinished_backtests() {
        let store = PaperStore::open_in_memory().unwrap();
        store
            .insert_run("stale", "BTCUSDT", RunSource::Backtest, 100.0, None, None, 0)
            .unwrap();
        store.insert_trade("stale", &trade_row(1, "open", None)).unwrap();
        store
            .insert_run("done", "BTCUSDT", RunSource::Backtest, 100.0, None, None, 0)
            .unwrap();
        store.finish_run("done", 10, 100.0, 0.0, 0.0, 0).unwrap();
        store
            .insert_run("live", "BTCUSDT", RunSource::Live, 100.0, None, None, 0)
            .unwrap();

        assert_eq!(store.purge_unfinished_backtests().unwrap(), 1);
        assert!(store.get_run("stale").unwrap().is_none());
        assert!(store.get_run("done").unwrap().is_some());
        assert!(store.get_run("live").unwrap().is_some());
        assert!(store.trades_for_run("stale").unwrap().is_empty());
    }

    #[test]
    fn orderflow_metrics_replace_on_same_second() {
        let store = PaperStore::open_in_memory().unwrap();
        let mut row = OrderflowMetricsRow {
            imbalance_ratio: Some(0.6),
            ..Default::default()
        };
        store.insert_orderflow_metrics("BTCUSDT", 100, &row).unwrap();
        row.imbalance_ratio = Some(0.4);
        store.insert_orderflow_metrics("BTCUSDT", 100, &row).unwrap();
        // Same key replaced, not duplicated.
        let conn = store.conn.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM orderflow_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn list_runs_filters() {
        let store = PaperStore::open_in_memory().unwrap();
        store
            .insert_run("a", "BTCUSDT", RunSource::Backtest, 100.0, None, None, 1)
            .unwrap();
        store
            .insert_run("b", "ETHUSDT", RunSource::Live, 100.0, None, None, 2)
            .unwrap();

        let backtests = store.list_runs(Some(RunSource::Backtest), None, 10).unwrap();
        assert_eq!(backtests.len(), 1);
        assert_eq!(backtests[0].run_id, "a");

        let eth = store.list_runs(None, Some("ETHUSDT"), 10).unwrap();
        assert_eq!(eth.len(), 1);
        assert_eq!(eth[0].run_id, "b");
    }
}
