// =============================================================================
// Candle Store — durable per-(symbol, timeframe) OHLCV archive
// =============================================================================
//
// One sqlite table `klines` with PRIMARY KEY (symbol, timeframe, start_time):
// the key makes inserts idempotent, duplicates are silently dropped via
// INSERT OR IGNORE. WAL journaling plus a 5 s busy timeout so the analyzer
// and auxiliaries can read while the accumulator writes from another
// process.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use crate::market_data::Candle;
use crate::types::Timeframe;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS klines (
    symbol     TEXT NOT NULL,
    timeframe  TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     REAL NOT NULL,
    PRIMARY KEY (symbol, timeframe, start_time)
);
CREATE INDEX IF NOT EXISTS ix_klines_symbol_tf_time ON klines (symbol, timeframe, start_time);
"#;

/// Anything the multi-TF coordinator can pull candle tails from: the store
/// in live mode, or prepared in-memory data in a backtest.
pub trait CandleSource {
    /// The most recent `limit` candles, returned oldest-first.
    fn candles_tail(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>>;
}

/// Durable candle archive. The connection is behind a mutex: sqlite in WAL
/// mode handles cross-process concurrency, the mutex handles in-process.
pub struct CandleStore {
    conn: Mutex<Connection>,
}

impl CandleStore {
    /// Open (and create if missing) the archive at `path`, switching the
    /// journal to WAL and arming the busy timeout.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open candle store at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("failed to apply klines schema")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("failed to set busy_timeout")?;
        info!(path = %path.display(), "candle store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ad-hoc replays.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a batch of candles. Duplicates on the primary key are ignored;
    /// the return value counts rows actually inserted.
    pub fn insert_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        candles: &[Candle],
    ) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin insert transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO klines
                 (symbol, timeframe, start_time, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in candles {
                inserted += stmt.execute(params![
                    symbol,
                    tf.as_str(),
                    c.start_time,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                ])?;
            }
        }
        tx.commit().context("failed to commit candle batch")?;
        Ok(inserted)
    }

    /// `start_time` of the newest candle for the series, if any.
    pub fn latest_start(&self, symbol: &str, tf: Timeframe) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn.query_row(
            "SELECT MAX(start_time) FROM klines WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, tf.as_str()],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// `start_time` of the oldest candle for the series, if any.
    pub fn oldest_start(&self, symbol: &str, tf: Timeframe) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn.query_row(
            "SELECT MIN(start_time) FROM klines WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, tf.as_str()],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Candle count, optionally filtered by symbol and/or timeframe.
    pub fn count(&self, symbol: Option<&str>, tf: Option<Timeframe>) -> Result<i64> {
        let conn = self.conn.lock();
        let count = match (symbol, tf) {
            (Some(s), Some(t)) => conn.query_row(
                "SELECT COUNT(*) FROM klines WHERE symbol = ?1 AND timeframe = ?2",
                params![s, t.as_str()],
                |row| row.get(0),
            )?,
            (Some(s), None) => conn.query_row(
                "SELECT COUNT(*) FROM klines WHERE symbol = ?1",
                params![s],
                |row| row.get(0),
            )?,
            (None, Some(t)) => conn.query_row(
                "SELECT COUNT(*) FROM klines WHERE timeframe = ?1",
                params![t.as_str()],
                |row| row.get(0),
            )?,
            (None, None) => conn.query_row("SELECT COUNT(*) FROM klines", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Load candles for a series in `start_time` order. `limit` with
    /// `order_asc = false` selects the newest rows, but the result is
    /// always returned oldest-first.
    pub fn candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        order_asc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let order = if order_asc { "ASC" } else { "DESC" };
        let sql = match limit {
            Some(_) => format!(
                "SELECT start_time, open, high, low, close, volume FROM klines
                 WHERE symbol = ?1 AND timeframe = ?2 ORDER BY start_time {order} LIMIT ?3"
            ),
            None => format!(
                "SELECT start_time, open, high, low, close, volume FROM klines
                 WHERE symbol = ?1 AND timeframe = ?2 ORDER BY start_time {order}"
            ),
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Candle> {
            Ok(Candle {
                start_time: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        };
        let mut out: Vec<Candle> = match limit {
            Some(n) => stmt
                .query_map(params![symbol, tf.as_str(), n as i64], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map(params![symbol, tf.as_str()], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };
        if !order_asc {
            out.reverse();
        }
        Ok(out)
    }

    /// The last `limit` candles with `start_time <= end_ms`, oldest-first.
    /// Used by backtests to reconstruct the view "as of" a moment.
    pub fn candles_before(
        &self,
        symbol: &str,
        tf: Timeframe,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT start_time, open, high, low, close, volume FROM klines
             WHERE symbol = ?1 AND timeframe = ?2 AND start_time <= ?3
             ORDER BY start_time DESC LIMIT ?4",
        )?;
        let mut out: Vec<Candle> = stmt
            .query_map(params![symbol, tf.as_str(), end_ms, limit as i64], |row| {
                Ok(Candle {
                    start_time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        out.reverse();
        Ok(out)
    }

    /// Operator reset: delete every candle for a symbol. Returns rows removed.
    pub fn delete_symbol(&self, symbol: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM klines WHERE symbol = ?1", params![symbol])?;
        Ok(n)
    }

    /// Operator reset: delete one series. Returns rows removed.
    pub fn delete_symbol_tf(&self, symbol: &str, tf: Timeframe) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM klines WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, tf.as_str()],
        )?;
        Ok(n)
    }
}

impl CandleSource for CandleStore {
    fn candles_tail(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        self.candles(symbol, tf, false, Some(limit))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(start_time: i64, close: f64) -> Candle {
        Candle::new(start_time, close, close + 100.0, close - 100.0, close, 10.0)
    }

    #[test]
    fn insert_dedupes_on_primary_key() {
        let store = CandleStore::open_in_memory().unwrap();
        let bar = Candle::new(1_700_000_000_000, 42_000.0, 42_100.0, 41_950.0, 42_050.0, 10.0);

        let first = store
            .insert_candles("BTCUSDT", Timeframe::H1, std::slice::from_ref(&bar))
            .unwrap();
        assert_eq!(first, 1);

        let second = store
            .insert_candles("BTCUSDT", Timeframe::H1, std::slice::from_ref(&bar))
            .unwrap();
        assert_eq!(second, 0);

        assert_eq!(store.count(Some("BTCUSDT"), Some(Timeframe::H1)).unwrap(), 1);
    }

    #[test]
    fn latest_oldest_and_tail_order() {
        let store = CandleStore::open_in_memory().unwrap();
        let bars: Vec<Candle> = (0..10).map(|i| candle(i * 60_000, 40_000.0 + i as f64)).collect();
        store.insert_candles("BTCUSDT", Timeframe::M1, &bars).unwrap();

        assert_eq!(store.oldest_start("BTCUSDT", Timeframe::M1).unwrap(), Some(0));
        assert_eq!(
            store.latest_start("BTCUSDT", Timeframe::M1).unwrap(),
            Some(9 * 60_000)
        );

        let tail = store.candles_tail("BTCUSDT", Timeframe::M1, 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].start_time < tail[1].start_time);
        assert_eq!(tail[2].start_time, 9 * 60_000);
    }

    #[test]
    fn series_are_isolated_by_key() {
        let store = CandleStore::open_in_memory().unwrap();
        store
            .insert_candles("BTCUSDT", Timeframe::M1, &[candle(0, 40_000.0)])
            .unwrap();
        store
            .insert_candles("BTCUSDT", Timeframe::M5, &[candle(0, 40_000.0)])
            .unwrap();
        store
            .insert_candles("ETHUSDT", Timeframe::M1, &[candle(0, 2_000.0)])
            .unwrap();

        assert_eq!(store.count(None, None).unwrap(), 3);
        assert_eq!(store.count(Some("BTCUSDT"), None).unwrap(), 2);
        assert_eq!(store.count(None, Some(Timeframe::M1)).unwrap(), 2);
    }

    #[test]
    fn candles_before_is_as_of_view() {
        let store = CandleStore::open_in_memory().unwrap();
        let bars: Vec<Candle> = (0..10).map(|i| candle(i * 60_000, 40_000.0 + i as f64)).collect();
        store.insert_candles("BTCUSDT", Timeframe::M1, &bars).unwrap();

        let view = store
            .candles_before("BTCUSDT", Timeframe::M1, 5 * 60_000, 3)
            .unwrap();
        assert_eq!(view.len(), 3);
        assert_eq!(view.last().unwrap().start_time, 5 * 60_000);
        assert_eq!(view[0].start_time, 3 * 60_000);
    }

    #[test]
    fn delete_resets_series() {
        let store = CandleStore::open_in_memory().unwrap();
        let bars: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, 40_000.0)).collect();
        store.insert_candles("BTCUSDT", Timeframe::M1, &bars).unwrap();
        store.insert_candles("BTCUSDT", Timeframe::M5, &bars).unwrap();

        assert_eq!(store.delete_symbol_tf("BTCUSDT", Timeframe::M1).unwrap(), 5);
        assert_eq!(store.count(Some("BTCUSDT"), None).unwrap(), 5);
        assert_eq!(store.delete_symbol("BTCUSDT").unwrap(), 5);
        assert_eq!(store.count(None, None).unwrap(), 0);
    }

    #[test]
    fn wal_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klines.db");
        {
            let store = CandleStore::open(&path).unwrap();
            store
                .insert_candles("BTCUSDT", Timeframe::H1, &[candle(0, 40_000.0)])
                .unwrap();
        }
        let store = CandleStore::open(&path).unwrap();
        assert_eq!(store.count(Some("BTCUSDT"), Some(Timeframe::H1)).unwrap(), 1);
    }
}
