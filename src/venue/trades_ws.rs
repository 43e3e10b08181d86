// =============================================================================
// Trade tape — WS publicTrade.{symbol} ring buffer
// =============================================================================
//
// Bybit delivers batches of executed prints (up to 1024 per frame). They are
// appended in arrival order to a bounded ring buffer; readers take copies
// filtered by time window.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::Trade;

/// Default ring capacity: the last 50k prints cover several minutes even on
/// an active market.
pub const TRADES_BUFFER_DEFAULT: usize = 50_000;

pub struct TradeTape {
    symbol: String,
    buffer: RwLock<VecDeque<Trade>>,
    capacity: usize,
}

impl TradeTape {
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            TRADES_BUFFER_DEFAULT
        } else {
            capacity
        };
        Self {
            symbol: symbol.into(),
            buffer: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Parse one WS frame and append its prints. Non-trade frames are
    /// ignored.
    pub fn apply_message(&self, text: &str) {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "trade frame parse failed");
                return;
            }
        };
        let Some(topic) = root["topic"].as_str() else {
            return;
        };
        if !topic.starts_with("publicTrade.") {
            return;
        }
        let Some(data) = root["data"].as_array() else {
            return;
        };
        let mut buffer = self.buffer.write();
        for raw in data {
            if let Some(trade) = parse_print(raw) {
                if buffer.len() >= self.capacity {
                    buffer.pop_front();
                }
                buffer.push_back(trade);
            }
        }
    }

    /// Directly append prints (REST fallback or historical replay).
    pub fn extend(&self, trades: impl IntoIterator<Item = Trade>) {
        let mut buffer = self.buffer.write();
        for trade in trades {
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(trade);
        }
    }

    /// Copy of the last `n` prints (all when `n` is `None`).
    pub fn recent(&self, n: Option<usize>) -> Vec<Trade> {
        let buffer = self.buffer.read();
        match n {
            Some(n) if n < buffer.len() => buffer.iter().skip(buffer.len() - n).cloned().collect(),
            _ => buffer.iter().cloned().collect(),
        }
    }

    /// Prints with `time_ms >= ts_ms`, e.g. the last 60 seconds.
    pub fn recent_since(&self, ts_ms: i64) -> Vec<Trade> {
        self.buffer
            .read()
            .iter()
            .filter(|t| t.time_ms >= ts_ms)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }
}

/// One print from the WS payload: `{T, S, v, p, i, seq, L}`.
fn parse_print(raw: &serde_json::Value) -> Option<Trade> {
    let time_ms = raw["T"].as_i64()?;
    let side = raw["S"].as_str()?;
    let size = raw["v"].as_str()?.parse::<f64>().ok()?;
    let price = raw["p"].as_str()?.parse::<f64>().ok()?;
    if size <= 0.0 || price <= 0.0 {
        return None;
    }
    Some(Trade {
        time_ms,
        is_buy: side.eq_ignore_ascii_case("buy"),
        size,
        price,
        id: raw["i"].as_str().unwrap_or("").to_string(),
        seq: raw["seq"]
            .as_i64()
            .or_else(|| raw["seq"].as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// WS task
// ---------------------------------------------------------------------------

/// Connect, subscribe to `publicTrade.{symbol}`, and feed prints into `tape`
/// until the stream drops, errors, or `stop` is raised. The caller owns the
/// reconnect loop.
pub async fn run_trades_stream(
    url: &str,
    symbol: &str,
    tape: Arc<TradeTape>,
    ping_interval_secs: u64,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trades WebSocket")?;
    info!(symbol, "trades WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    let sub = serde_json::json!({
        "op": "subscribe",
        "args": [format!("publicTrade.{symbol}")],
    });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to subscribe to trades stream")?;

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs.max(1)));
    ping.tick().await;
    let mut stop_check = tokio::time::interval(std::time::Duration::from_millis(500));

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => tape.apply_message(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(symbol, "trades WebSocket stream ended");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol, error = %e, "trades WebSocket read error");
                    return Err(e.into());
                }
            },
            _ = ping.tick() => {
                write
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .context("trades ping failed")?;
            }
            _ = stop_check.tick() => {
                if stop.load(Ordering::Relaxed) {
                    info!(symbol, "trades WebSocket stopping");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn frame(prints: &str) -> String {
        format!(r#"{{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1,"data":{prints}}}"#)
    }

    #[test]
    fn parses_batch_in_order() {
        let tape = TradeTape::new("BTCUSDT", 100);
        tape.apply_message(&frame(
            r#"[{"T":1000,"S":"Buy","v":"0.5","p":"42000","i":"a","seq":1,"L":"PlusTick"},
                {"T":1001,"S":"Sell","v":"0.3","p":"41999","i":"b","seq":2,"L":"MinusTick"}]"#,
        ));
        let all = tape.recent(None);
        assert_eq!(all.len(), 2);
        assert!(all[0].is_buy);
        assert!(!all[1].is_buy);
        assert_eq!(all[1].time_ms, 1001);
    }

    #[test]
    fn ring_buffer_caps_capacity() {
        let tape = TradeTape::new("BTCUSDT", 3);
        for i in 0..5 {
            tape.extend([Trade {
                time_ms: i,
                is_buy: true,
                size: 1.0,
                price: 100.0,
                id: String::new(),
                seq: i,
            }]);
        }
        let all = tape.recent(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].time_ms, 2); // oldest two evicted
    }

    #[test]
    fn recent_since_filters_by_window() {
        let tape = TradeTape::new("BTCUSDT", 100);
        tape.extend((0..10).map(|i| Trade {
            time_ms: i * 1000,
            is_buy: true,
            size: 1.0,
            price: 100.0,
            id: String::new(),
            seq: i,
        }));
        let window = tape.recent_since(7000);
        assert_eq!(window.len(), 3);
        assert!(window.iter().all(|t| t.time_ms >= 7000));
    }

    #[test]
    fn zero_size_prints_rejected() {
        let tape = TradeTape::new("BTCUSDT", 100);
        tape.apply_message(&frame(
            r#"[{"T":1000,"S":"Buy","v":"0","p":"42000","i":"a","seq":1}]"#,
        ));
        assert!(tape.is_empty());
    }
}
