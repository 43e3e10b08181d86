// =============================================================================
// Trade / skip CSV sinks
// =============================================================================
//
// Append-only CSV logs next to the database rows. On startup any non-empty
// previous files are archived with a timestamp suffix so sessions never mix
// in one file. Sink failures are logged and swallowed — a full disk must
// not kill a tick.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::store::{SkipRow, TradeRow};

const TRADES_FILE: &str = "sandbox_trades.csv";
const SKIPS_FILE: &str = "sandbox_skips.csv";

const TRADES_HEADERS: [&str; 15] = [
    "ts_utc",
    "ts_unix",
    "action",
    "side",
    "price",
    "size",
    "notional_usd",
    "commission_usd",
    "realized_pnl_usd",
    "signal_direction",
    "signal_confidence",
    "reason",
    "leverage",
    "exit_reason",
    "entry_type",
];

const SKIPS_HEADERS: [&str; 5] = ["ts_utc", "ts_unix", "direction", "confidence", "skip_reason"];

pub struct TradeLog {
    trades_path: PathBuf,
    skips_path: PathBuf,
}

impl TradeLog {
    /// Create the sink under `log_dir`, archiving leftovers from previous
    /// sessions.
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let log = Self {
            trades_path: log_dir.join(TRADES_FILE),
            skips_path: log_dir.join(SKIPS_FILE),
        };
        log.archive_previous();
        Ok(log)
    }

    fn archive_previous(&self) {
        let suffix = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        for path in [&self.trades_path, &self.skips_path] {
            let non_empty = path
                .metadata()
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if !non_empty {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let archive = path.with_file_name(format!("{stem}_archive_{suffix}.csv"));
            match std::fs::rename(path, &archive) {
                Ok(()) => info!(from = %path.display(), to = %archive.display(), "archived sandbox log"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to archive sandbox log"),
            }
        }
    }

    fn writer(path: &Path, headers: &[&str]) -> Result<csv::Writer<std::fs::File>> {
        let exists = path.exists() && path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !exists {
            writer.write_record(headers)?;
        }
        Ok(writer)
    }

    pub fn append_trade(&self, row: &TradeRow) -> Result<()> {
        let mut writer = Self::writer(&self.trades_path, &TRADES_HEADERS)?;
        writer.write_record([
            row.ts_utc.as_str(),
            &row.ts_unix.to_string(),
            &row.action,
            &row.side,
            &format!("{:.2}", row.price),
            &format!("{:.6}", row.size),
            &format!("{:.2}", row.notional_usd),
            &format!("{:.4}", row.commission_usd),
            &row.realized_pnl_usd
                .map(|p| format!("{p:.4}"))
                .unwrap_or_default(),
            &row.signal_direction,
            &format!("{:.4}", row.signal_confidence),
            &row.reason,
            &format!("{:.2}", row.leverage),
            &row.exit_reason,
            &row.entry_type,
        ])?;
        writer.flush()?;
        Ok(())
    }

    pub fn append_skip(&self, row: &SkipRow) -> Result<()> {
        let mut writer = Self::writer(&self.skips_path, &SKIPS_HEADERS)?;
        writer.write_record([
            row.ts_utc.as_str(),
            &row.ts_unix.to_string(),
            &row.direction,
            &format!("{:.4}", row.confidence),
            &row.skip_reason,
        ])?;
        writer.flush()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade_row() -> TradeRow {
        TradeRow {
            ts_utc: "2026-01-01 00:00:00".into(),
            ts_unix: 1_700_000_000,
            action: "open".into(),
            side: "long".into(),
            price: 20_000.0,
            size: 0.01,
            notional_usd: 200.0,
            commission_usd: 0.12,
            realized_pnl_usd: None,
            signal_direction: "long".into(),
            signal_confidence: 0.5,
            reason: "delta positive".into(),
            leverage: 2.0,
            exit_reason: String::new(),
            entry_type: "microstructure".into(),
        }
    }

    #[test]
    fn writes_headers_once_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path()).unwrap();
        log.append_trade(&trade_row()).unwrap();
        log.append_trade(&trade_row()).unwrap();

        let content = std::fs::read_to_string(dir.path().join(TRADES_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ts_utc,ts_unix,action"));
        assert!(lines[1].contains("open"));
    }

    #[test]
    fn archives_previous_session_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = TradeLog::new(dir.path()).unwrap();
            log.append_trade(&trade_row()).unwrap();
        }
        // Second session archives the first file.
        let log = TradeLog::new(dir.path()).unwrap();
        log.append_trade(&trade_row()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("archive")));
        let content = std::fs::read_to_string(dir.path().join(TRADES_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2); // header + one row
    }

    #[test]
    fn skip_rows_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path()).unwrap();
        log.append_skip(&SkipRow {
            ts_utc: "2026-01-01 00:00:00".into(),
            ts_unix: 1_700_000_000,
            direction: "long".into(),
            confidence: 0.4,
            skip_reason: "cooldown".into(),
        })
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join(SKIPS_FILE)).unwrap();
        assert!(content.contains("cooldown"));
    }
}
