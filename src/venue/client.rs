// =============================================================================
// Bybit V5 REST client — klines, orderbook, recent trades
// =============================================================================
//
// Market-data paths work without credentials; when keys are configured every
// request also carries the V5 auth headers (HMAC-SHA256 over
// `timestamp + api_key + recv_window + query`). The secret never appears in
// logs or Debug output.
//
// Retries: rate-limit retCodes (10006/10007), busy/timeout retCodes
// (10016/10017), HTTP 429/5xx, and transport timeouts/connection errors are
// retried with exponential backoff capped at `max_retries`. Any other
// non-zero retCode fails the call.
// =============================================================================

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::Config;
use crate::market_data::{BookSnapshot, Candle, Trade};
use crate::types::Timeframe;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Max `(high - low) / open` before a bar is considered garbage.
const MAX_RANGE_RATIO_INTRADAY: f64 = 0.30;
const MAX_RANGE_RATIO_DAILY: f64 = 0.50;

pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    category: String,
    max_retries: u32,
    backoff_secs: f64,
}

impl BybitClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: if cfg.testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            category: cfg.category.clone(),
            max_retries: cfg.exchange_max_retries.max(1),
            backoff_secs: cfg.retry_backoff_secs.max(0.0),
        })
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Fetch up to `limit` candles, ascending by time. `start_ms`/`end_ms`
    /// bound the range for backfill; without them the newest bars come back.
    /// Implausible bars are filtered before returning.
    pub async fn get_klines(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let mut query = vec![
            ("category".to_string(), self.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), tf.as_str().to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(start) = start_ms {
            query.push(("start".to_string(), start.to_string()));
        }
        if let Some(end) = end_ms {
            query.push(("end".to_string(), end.to_string()));
        }

        let result = self.request("/v5/market/kline", &query).await?;
        let raw = result["list"].as_array().cloned().unwrap_or_default();
        let parsed = parse_kline_list(&raw)?;
        Ok(filter_plausible(parsed, symbol, &self.category, tf))
    }

    /// Page backward from `end_ms` until the venue runs out of data or
    /// `max_candles` is reached. `max_candles = None` loads everything.
    /// Result is ascending by time.
    pub async fn fetch_klines_backfill(
        &self,
        symbol: &str,
        tf: Timeframe,
        end_ms: i64,
        max_candles: Option<usize>,
    ) -> Result<Vec<Candle>> {
        const LIMIT_PER_REQUEST: usize = 1000;
        let mut all: Vec<Candle> = Vec::new();
        let mut current_end = end_ms;

        loop {
            if let Some(max) = max_candles {
                if all.len() >= max {
                    break;
                }
            }
            let chunk = self
                .get_klines(symbol, tf, LIMIT_PER_REQUEST, None, Some(current_end))
                .await?;
            if chunk.is_empty() {
                break;
            }
            let chunk_len = chunk.len();
            current_end = chunk
                .iter()
                .map(|c| c.start_time)
                .min()
                .expect("non-empty chunk has a minimum")
                - 1;
            let mut merged = chunk;
            merged.extend(all);
            all = merged;
            if chunk_len < LIMIT_PER_REQUEST {
                break;
            }
        }

        if let Some(max) = max_candles {
            all.truncate(max);
        }
        Ok(all)
    }

    // -------------------------------------------------------------------------
    // Orderbook & recent trades (REST snapshots)
    // -------------------------------------------------------------------------

    /// REST order-book snapshot: bids descending, asks ascending.
    /// For real-time depth use `LiveOrderBook` with the WS stream.
    pub async fn get_orderbook(&self, symbol: &str, limit: usize) -> Result<BookSnapshot> {
        let limit = limit.clamp(1, 500);
        let query = vec![
            ("category".to_string(), self.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let result = self.request("/v5/market/orderbook", &query).await?;

        let parse_side = |key: &str| -> Vec<(f64, f64)> {
            result[key]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|item| {
                            let price = parse_str_f64(item.get(0)?).ok()?;
                            let size = parse_str_f64(item.get(1)?).ok()?;
                            Some((price, size))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(BookSnapshot {
            symbol: result["s"].as_str().unwrap_or(symbol).to_string(),
            bids: parse_side("b"),
            asks: parse_side("a"),
            ts: result["ts"].as_i64().unwrap_or(0),
            update_id: result["u"].as_i64().unwrap_or(0),
            seq: result["seq"].as_i64().unwrap_or(0),
        })
    }

    /// Recent public executions, ascending by time. REST fallback for
    /// "today" when no bulk tick archive exists yet.
    pub async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>> {
        let limit = limit.clamp(1, 1000);
        let query = vec![
            ("category".to_string(), self.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let result = self.request("/v5/market/recent-trade", &query).await?;
        let raw = result["list"].as_array().cloned().unwrap_or_default();

        let mut trades: Vec<Trade> = raw
            .iter()
            .filter_map(|r| {
                let time_ms = r["time"]
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .or_else(|| r["time"].as_i64())?;
                let price = parse_str_f64(&r["price"]).ok()?;
                let size = parse_str_f64(&r["size"]).ok()?;
                if price <= 0.0 || size <= 0.0 {
                    return None;
                }
                let side = r["side"].as_str().unwrap_or("Buy");
                Some(Trade {
                    time_ms,
                    is_buy: side.eq_ignore_ascii_case("buy"),
                    size,
                    price,
                    id: r["execId"].as_str().unwrap_or("").to_string(),
                    seq: r["seq"]
                        .as_i64()
                        .or_else(|| r["seq"].as_str().and_then(|s| s.parse().ok()))
                        .unwrap_or(0),
                })
            })
            .collect();
        trades.sort_by_key(|t| t.time_ms);
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Transport with retries
    // -------------------------------------------------------------------------

    async fn request(&self, path: &str, query: &[(String, String)]) -> Result<serde_json::Value> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}{}?{}", self.base_url, path, query_string);

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..self.max_retries {
            let mut req = self.client.get(&url);
            if !self.api_key.is_empty() && !self.api_secret.is_empty() {
                let ts = chrono::Utc::now().timestamp_millis().to_string();
                let payload = format!("{ts}{}{RECV_WINDOW}{query_string}", self.api_key);
                req = req
                    .header("X-BAPI-API-KEY", &self.api_key)
                    .header("X-BAPI-TIMESTAMP", &ts)
                    .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                    .header("X-BAPI-SIGN", self.sign(&payload));
            }

            let outcome = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        Err(anyhow::anyhow!("HTTP {status} from {path}"))
                    } else {
                        match resp.json::<serde_json::Value>().await {
                            Ok(body) => Ok(body),
                            Err(e) => Err(anyhow::Error::from(e).context("failed to parse response body")),
                        }
                    }
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                    if !retryable {
                        return Err(anyhow::Error::from(e).context(format!("GET {path} failed")));
                    }
                    Err(anyhow::Error::from(e))
                }
            };

            match outcome {
                Ok(body) => {
                    let ret_code = body["retCode"].as_i64().unwrap_or(-1);
                    if ret_code == 0 {
                        return Ok(body["result"].clone());
                    }
                    let ret_msg = body["retMsg"].as_str().unwrap_or("").to_string();
                    if is_retryable_ret_code(ret_code, &ret_msg) {
                        last_err = Some(anyhow::anyhow!("Bybit {path}: retCode={ret_code} {ret_msg}"));
                    } else {
                        bail!("Bybit {path} error: retCode={ret_code} {ret_msg}");
                    }
                }
                Err(e) => last_err = Some(e),
            }

            let wait = self.backoff_secs * 2_f64.powi(attempt as i32);
            warn!(
                path,
                attempt = attempt + 1,
                max = self.max_retries,
                wait_secs = wait,
                "request failed, backing off"
            );
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Bybit {path}: retries exceeded")))
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("category", &self.category)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing & filtering
// ---------------------------------------------------------------------------

/// Whether a Bybit retCode should be retried rather than surfaced.
fn is_retryable_ret_code(code: i64, msg: &str) -> bool {
    if matches!(code, 10006 | 10007 | 10016 | 10017) {
        return true;
    }
    let msg = msg.to_lowercase();
    msg.contains("rate") || msg.contains("too many") || msg.contains("limit")
}

/// Parse a JSON value that may be a string or number into f64.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        bail!("expected string or number, got: {val}")
    }
}

/// Convert the venue's newest-first `[startTime, o, h, l, c, vol, turnover]`
/// rows into ascending candles.
fn parse_kline_list(raw: &[serde_json::Value]) -> Result<Vec<Candle>> {
    let mut out = Vec::with_capacity(raw.len());
    for item in raw.iter().rev() {
        let arr = match item.as_array() {
            Some(a) if a.len() >= 6 => a,
            _ => {
                warn!("skipping malformed kline row: {item}");
                continue;
            }
        };
        let start_time = arr[0]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| arr[0].as_i64())
            .context("kline row missing startTime")?;
        out.push(Candle {
            start_time,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }
    Ok(out)
}

/// Per-symbol sanity band for linear contracts: a price far outside it means
/// the row is corrupt (e.g. turnover landed in a price column).
fn price_range_for(symbol: &str, category: &str) -> (f64, f64) {
    if category != "linear" {
        return (0.01, 50_000_000.0);
    }
    let sym = symbol.trim().to_uppercase();
    if sym.contains("BTCUSDT") {
        (1_000.0, 150_000.0)
    } else if sym.contains("ETHUSDT") {
        (100.0, 100_000.0)
    } else {
        (0.01, 50_000_000.0)
    }
}

fn max_range_ratio_for(tf: Timeframe) -> f64 {
    match tf {
        Timeframe::D1 | Timeframe::W1 | Timeframe::Mn1 => MAX_RANGE_RATIO_DAILY,
        _ => MAX_RANGE_RATIO_INTRADAY,
    }
}

/// Drop bars with OHLC outside the sanity band or an absurd intrabar range.
/// Logs one summary line per call when anything was dropped.
fn filter_plausible(candles: Vec<Candle>, symbol: &str, category: &str, tf: Timeframe) -> Vec<Candle> {
    if candles.is_empty() {
        return candles;
    }
    let (low_ok, high_ok) = price_range_for(symbol, category);
    let max_ratio = max_range_ratio_for(tf);
    let mut dropped = 0usize;
    let total = candles.len();
    let valid: Vec<Candle> = candles
        .into_iter()
        .filter(|c| {
            if !c.is_valid() {
                dropped += 1;
                debug!(symbol, ts = c.start_time, "bar dropped: invalid OHLC");
                return false;
            }
            let mn = c.open.min(c.high).min(c.low).min(c.close);
            let mx = c.open.max(c.high).max(c.low).max(c.close);
            if mn < low_ok || mx > high_ok {
                dropped += 1;
                debug!(
                    symbol,
                    ts = c.start_time,
                    low = mn,
                    high = mx,
                    "bar dropped: price outside sanity band"
                );
                return false;
            }
            if c.open > 0.0 && (c.high - c.low) / c.open > max_ratio {
                dropped += 1;
                debug!(
                    symbol,
                    ts = c.start_time,
                    ratio = (c.high - c.low) / c.open,
                    "bar dropped: absurd range"
                );
                return false;
            }
            true
        })
        .collect();
    if dropped > 0 {
        warn!(
            symbol,
            tf = %tf,
            dropped,
            kept = valid.len(),
            total,
            "implausible bars filtered"
        );
    }
    valid
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_codes() {
        assert!(is_retryable_ret_code(10006, ""));
        assert!(is_retryable_ret_code(10016, "service busy"));
        assert!(is_retryable_ret_code(0, "Too Many Visits"));
        assert!(!is_retryable_ret_code(10001, "params error"));
    }

    #[test]
    fn kline_list_parses_newest_first_into_ascending() {
        let raw = vec![
            json!(["1700000060000", "42050", "42100", "42000", "42080", "5", "210000"]),
            json!(["1700000000000", "42000", "42100", "41950", "42050", "10", "420000"]),
        ];
        let parsed = parse_kline_list(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].start_time, 1_700_000_000_000);
        assert_eq!(parsed[1].start_time, 1_700_000_060_000);
        assert!((parsed[0].open - 42_000.0).abs() < 1e-9);
    }

    #[test]
    fn plausibility_rejects_out_of_band_price() {
        let good = Candle::new(0, 42_000.0, 42_100.0, 41_950.0, 42_050.0, 10.0);
        let turnover_in_price = Candle::new(1, 42_000.0, 4_200_000.0, 41_950.0, 42_050.0, 10.0);
        let kept = filter_plausible(
            vec![good.clone(), turnover_in_price],
            "BTCUSDT",
            "linear",
            Timeframe::M15,
        );
        assert_eq!(kept, vec![good]);
    }

    #[test]
    fn plausibility_range_threshold_depends_on_tf() {
        // 40% intrabar range: rejected intraday, accepted on D.
        let wild = Candle::new(0, 100.0, 130.0, 90.0, 120.0, 10.0);
        assert!(filter_plausible(vec![wild.clone()], "XYZUSDT", "linear", Timeframe::M15).is_empty());
        assert_eq!(
            filter_plausible(vec![wild.clone()], "XYZUSDT", "linear", Timeframe::D1).len(),
            1
        );
    }

    #[test]
    fn price_band_per_symbol() {
        assert_eq!(price_range_for("BTCUSDT", "linear"), (1_000.0, 150_000.0));
        assert_eq!(price_range_for("ETHUSDT", "linear"), (100.0, 100_000.0));
        assert_eq!(price_range_for("BTCUSDT", "spot"), (0.01, 50_000_000.0));
    }
}
