// =============================================================================
// Historical tick archive — CSV[.gz] loader (read-only)
// =============================================================================
//
// Layout: `{history_root}/trades/{SYMBOL}/[{YYYY}/]{SYMBOL}{YYYY-MM-DD}.csv[.gz]`.
// Files carry a header row; columns are matched semantically (any header
// containing `time` is the timestamp — seconds with a fractional part or
// milliseconds — `price`, `size`/`qty`, `side`). Rows inside a file ascend
// by time; files are ordered by the date embedded in the name.
// =============================================================================

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::warn;

use crate::market_data::Trade;

/// Directory holding tick CSVs for `symbol` (flat or one folder per year).
pub fn trades_dir(history_root: &Path, symbol: &str) -> PathBuf {
    history_root.join("trades").join(symbol.trim().to_uppercase())
}

/// Convert a raw timestamp to milliseconds: values below 1e12 are seconds
/// (possibly fractional), everything else already ms.
fn normalize_ts_ms(raw: &str) -> Option<i64> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if value < 1e12 {
        Some((value * 1000.0) as i64)
    } else {
        Some(value as i64)
    }
}

/// Resolve column indices from the header row by semantic match.
/// Returns `(time, price, size, side)`; side may be absent.
fn detect_columns(headers: &csv::StringRecord) -> Option<(usize, usize, usize, Option<usize>)> {
    let mut time_col = None;
    let mut price_col = None;
    let mut size_col = None;
    let mut side_col = None;
    for (i, h) in headers.iter().enumerate() {
        let h = h.trim().to_lowercase();
        if h.is_empty() {
            continue;
        }
        if time_col.is_none() && h.contains("time") {
            time_col = Some(i);
        } else if price_col.is_none() && h.contains("price") {
            price_col = Some(i);
        } else if size_col.is_none() && (h.contains("size") || h.contains("qty")) {
            size_col = Some(i);
        } else if side_col.is_none() && h.contains("side") {
            side_col = Some(i);
        }
    }
    Some((time_col?, price_col?, size_col?, side_col))
}

/// Date string (YYYY-MM-DD) embedded in a tick file name, also accepting
/// the dash-less YYYYMMDD form. Used only for ordering and range filters.
fn date_from_file_name(path: &Path) -> Option<String> {
    let mut stem = path.file_stem()?.to_string_lossy().to_string();
    if stem.ends_with(".csv") {
        stem.truncate(stem.len() - 4);
    }
    let bytes = stem.as_bytes();

    // YYYY-MM-DD
    for i in 0..bytes.len().saturating_sub(9) {
        let b = &bytes[i..i + 10];
        let shaped = b.iter().enumerate().all(|(j, &c)| {
            if j == 4 || j == 7 {
                c == b'-'
            } else {
                c.is_ascii_digit()
            }
        });
        if shaped {
            return String::from_utf8(b.to_vec()).ok();
        }
    }
    // YYYYMMDD
    for i in 0..bytes.len().saturating_sub(7) {
        let b = &bytes[i..i + 8];
        if b.iter().all(|c| c.is_ascii_digit()) {
            let digits = String::from_utf8(b.to_vec()).ok()?;
            let month: u32 = digits[4..6].parse().ok()?;
            let day: u32 = digits[6..8].parse().ok()?;
            if (1..=12).contains(&month) && (1..=31).contains(&day) {
                return Some(format!("{}-{}-{}", &digits[..4], &digits[4..6], &digits[6..8]));
            }
        }
    }
    None
}

/// Tick files for `symbol` as `(path, date)` ordered by date. Looks in the
/// flat symbol directory and in 4-digit year subdirectories.
pub fn list_trade_files(history_root: &Path, symbol: &str) -> Vec<(PathBuf, String)> {
    let dir = trades_dir(history_root, symbol);
    let mut out = Vec::new();
    collect_files(&dir, &mut out);
    out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    out
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, String)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if name.len() == 4 && name.chars().all(|c| c.is_ascii_digit()) {
                collect_files(&path, out);
            }
            continue;
        }
        let is_csv = name.ends_with(".csv") || name.ends_with(".csv.gz");
        if !is_csv {
            continue;
        }
        if let Some(date) = date_from_file_name(&path) {
            out.push((path, date));
        }
    }
}

/// Dates (YYYY-MM-DD) for which tick files exist, sorted ascending.
pub fn list_downloaded_dates(history_root: &Path, symbol: &str) -> Vec<String> {
    let mut dates: Vec<String> = list_trade_files(history_root, symbol)
        .into_iter()
        .map(|(_, d)| d)
        .collect();
    dates.dedup();
    dates
}

/// Parse one tick CSV (optionally gzipped) into trades. Invalid rows are
/// skipped; a file whose header cannot be resolved yields nothing.
pub fn parse_trades_csv(path: &Path) -> Result<Vec<Trade>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let Some((time_col, price_col, size_col, side_col)) = detect_columns(&headers) else {
        warn!(path = %path.display(), ?headers, "could not resolve tick CSV columns");
        return Ok(Vec::new());
    };

    let mut trades = Vec::new();
    for (row_num, record) in csv_reader.records().enumerate() {
        let Ok(record) = record else {
            continue;
        };
        let Some(time_ms) = record.get(time_col).and_then(normalize_ts_ms) else {
            continue;
        };
        let Some(price) = record.get(price_col).and_then(|v| v.trim().parse::<f64>().ok())
        else {
            continue;
        };
        let Some(size) = record.get(size_col).and_then(|v| v.trim().parse::<f64>().ok()) else {
            continue;
        };
        if price <= 0.0 || size <= 0.0 {
            continue;
        }
        let is_buy = side_col
            .and_then(|i| record.get(i))
            .map(|s| s.trim().to_lowercase().starts_with('b'))
            .unwrap_or(true);
        trades.push(Trade {
            time_ms,
            is_buy,
            size,
            price,
            id: format!("row_{row_num}"),
            seq: row_num as i64,
        });
    }
    Ok(trades)
}

/// Load every tick in `[date_from, date_to]` (inclusive, YYYY-MM-DD; `None`
/// = unbounded) sorted by time across files.
pub fn load_trades(
    history_root: &Path,
    symbol: &str,
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Result<Vec<Trade>> {
    let mut all = Vec::new();
    for (path, date) in list_trade_files(history_root, symbol) {
        if let Some(from) = date_from {
            if date.as_str() < from {
                continue;
            }
        }
        if let Some(to) = date_to {
            if date.as_str() > to {
                continue;
            }
        }
        all.extend(parse_trades_csv(&path)?);
    }
    all.sort_by_key(|t| t.time_ms);
    Ok(all)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn semantic_header_detection() {
        let headers = csv::StringRecord::from(vec!["exec_time", "symbol", "side", "exec_qty", "trade_price"]);
        let (t, p, s, side) = detect_columns(&headers).unwrap();
        assert_eq!(t, 0);
        assert_eq!(p, 4);
        assert_eq!(s, 3);
        assert_eq!(side, Some(2));
    }

    #[test]
    fn timestamps_normalize_to_ms() {
        assert_eq!(normalize_ts_ms("1700000000.5"), Some(1_700_000_000_500));
        assert_eq!(normalize_ts_ms("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(normalize_ts_ms("garbage"), None);
        assert_eq!(normalize_ts_ms("-5"), None);
    }

    #[test]
    fn dates_from_file_names() {
        assert_eq!(
            date_from_file_name(Path::new("BTCUSDT2023-01-08.csv")),
            Some("2023-01-08".to_string())
        );
        assert_eq!(
            date_from_file_name(Path::new("BTCUSDT20230108.csv.gz")),
            Some("2023-01-08".to_string())
        );
        assert_eq!(date_from_file_name(Path::new("notes.csv")), None);
    }

    #[test]
    fn load_trades_across_files_sorted_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let dir = trades_dir(root, "BTCUSDT");
        write_csv(
            &dir,
            "BTCUSDT2023-01-02.csv",
            "timestamp,side,size,price\n1672617600.0,Sell,0.2,16700\n1672617601.0,Buy,0.1,16710\n",
        );
        write_csv(
            &dir,
            "BTCUSDT2023-01-01.csv",
            "timestamp,side,size,price\n1672531200.0,Buy,0.5,16600\n",
        );

        let all = load_trades(root, "BTCUSDT", None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].time_ms <= w[1].time_ms));
        assert!(all[0].is_buy);
        assert!(!all[1].is_buy);

        let day2 = load_trades(root, "BTCUSDT", Some("2023-01-02"), None).unwrap();
        assert_eq!(day2.len(), 2);
    }

    #[test]
    fn gzip_files_are_transparent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = trades_dir(tmp.path(), "BTCUSDT");
        std::fs::create_dir_all(&dir).unwrap();

        let body = "timestamp,side,size,price\n1672531200.0,Buy,0.5,16600\n";
        let file = File::create(dir.join("BTCUSDT2023-01-01.csv.gz")).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let all = load_trades(tmp.path(), "BTCUSDT", None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert!((all[0].price - 16_600.0).abs() < 1e-9);
    }

    #[test]
    fn year_subdirectories_are_walked() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = trades_dir(tmp.path(), "BTCUSDT").join("2023");
        write_csv(
            &dir,
            "BTCUSDT2023-06-01.csv",
            "timestamp,side,size,price\n1685577600.0,Buy,1.0,27000\n",
        );
        let dates = list_downloaded_dates(tmp.path(), "BTCUSDT");
        assert_eq!(dates, vec!["2023-06-01"]);
    }

    #[test]
    fn invalid_rows_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = trades_dir(tmp.path(), "BTCUSDT");
        write_csv(
            &dir,
            "BTCUSDT2023-01-01.csv",
            "timestamp,side,size,price\n\
             1672531200.0,Buy,0.5,16600\n\
             bad,Buy,0.5,16600\n\
             1672531201.0,Buy,0,16600\n\
             1672531202.0,Sell,0.1,-5\n",
        );
        let all = load_trades(tmp.path(), "BTCUSDT", None, None).unwrap();
        assert_eq!(all.len(), 1);
    }
}
