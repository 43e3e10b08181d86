// =============================================================================
// Live order book — WS orderbook.{depth}.{symbol} snapshot/delta stream
// =============================================================================
//
// Bybit sends one `snapshot` first, then `delta` frames. Application rules:
// a snapshot (or update_id == 1) replaces the whole book; a delta applies
// per-level in arrival order, `size = 0` deletes the level, anything else
// upserts. The local book keys levels by the venue's price string so float
// formatting can never split a level; the sorted view is built on demand.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::BookSnapshot;

#[derive(Default)]
struct BookState {
    bids: HashMap<String, f64>,
    asks: HashMap<String, f64>,
    ts: i64,
    update_id: i64,
    seq: i64,
}

/// Thread-safe order book fed by the WS task, read by the control loop.
pub struct LiveOrderBook {
    symbol: String,
    state: RwLock<BookState>,
}

impl LiveOrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: RwLock::new(BookState::default()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply one WS frame. Unknown topics and malformed frames are ignored
    /// with a debug log; they must never poison the book.
    pub fn apply_message(&self, text: &str) {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "orderbook frame parse failed");
                return;
            }
        };
        let Some(topic) = root["topic"].as_str() else {
            return; // subscription ack / pong
        };
        if !topic.starts_with("orderbook.") {
            return;
        }
        let data = &root["data"];
        let msg_type = root["type"].as_str().unwrap_or("delta");
        let ts = root["ts"].as_i64().unwrap_or(0);
        let update_id = data["u"].as_i64().unwrap_or(0);
        let seq = data["seq"].as_i64().unwrap_or(0);
        let bids = data["b"].as_array().cloned().unwrap_or_default();
        let asks = data["a"].as_array().cloned().unwrap_or_default();

        let mut state = self.state.write();
        // update_id == 1 is Bybit's "service restart, treat as snapshot".
        if msg_type == "snapshot" || update_id == 1 {
            state.bids.clear();
            state.asks.clear();
            insert_levels(&mut state.bids, &bids, true);
            insert_levels(&mut state.asks, &asks, true);
        } else {
            insert_levels(&mut state.bids, &bids, false);
            insert_levels(&mut state.asks, &asks, false);
        }
        state.ts = ts;
        state.update_id = update_id;
        state.seq = seq;
    }

    /// Copy of the current book, bids descending / asks ascending.
    pub fn snapshot(&self) -> BookSnapshot {
        let state = self.state.read();
        let mut bids: Vec<(f64, f64)> = state
            .bids
            .iter()
            .filter_map(|(p, &s)| p.parse::<f64>().ok().map(|price| (price, s)))
            .collect();
        let mut asks: Vec<(f64, f64)> = state
            .asks
            .iter()
            .filter_map(|(p, &s)| p.parse::<f64>().ok().map(|price| (price, s)))
            .collect();
        bids.sort_by(|a, b| b.0.total_cmp(&a.0));
        asks.sort_by(|a, b| a.0.total_cmp(&b.0));
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids,
            asks,
            ts: state.ts,
            update_id: state.update_id,
            seq: state.seq,
        }
    }
}

/// Apply raw `[price, size]` pairs. In snapshot mode zero-size levels are
/// skipped outright; in delta mode they delete.
fn insert_levels(side: &mut HashMap<String, f64>, raw: &[serde_json::Value], snapshot: bool) {
    for item in raw {
        let Some(price) = item.get(0).and_then(|p| p.as_str()) else {
            continue;
        };
        let Some(size) = item
            .get(1)
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse::<f64>().ok())
        else {
            continue;
        };
        if size == 0.0 {
            if !snapshot {
                side.remove(price);
            }
        } else {
            side.insert(price.to_string(), size);
        }
    }
}

// ---------------------------------------------------------------------------
// WS task
// ---------------------------------------------------------------------------

pub fn public_ws_url(testnet: bool, category: &str) -> String {
    let host = if testnet {
        "stream-testnet.bybit.com"
    } else {
        "stream.bybit.com"
    };
    format!("wss://{host}/v5/public/{category}")
}

/// Connect, subscribe to `orderbook.{depth}.{symbol}`, and feed frames into
/// `book` until the stream drops, errors, or `stop` is raised. The caller
/// (main.rs) owns the reconnect loop. Sends the venue's `{"op":"ping"}`
/// heartbeat every `ping_interval_secs`.
pub async fn run_orderbook_stream(
    url: &str,
    symbol: &str,
    depth: usize,
    book: Arc<LiveOrderBook>,
    ping_interval_secs: u64,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to orderbook WebSocket")?;
    info!(symbol, depth, "orderbook WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    let sub = serde_json::json!({
        "op": "subscribe",
        "args": [format!("orderbook.{depth}.{symbol}")],
    });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to subscribe to orderbook stream")?;

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs.max(1)));
    ping.tick().await; // first tick fires immediately, skip it
    let mut stop_check = tokio::time::interval(std::time::Duration::from_millis(500));

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => book.apply_message(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(symbol, "orderbook WebSocket stream ended");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol, error = %e, "orderbook WebSocket read error");
                    return Err(e.into());
                }
            },
            _ = ping.tick() => {
                write
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .context("orderbook ping failed")?;
            }
            _ = stop_check.tick() => {
                if stop.load(Ordering::Relaxed) {
                    info!(symbol, "orderbook WebSocket stopping");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}
