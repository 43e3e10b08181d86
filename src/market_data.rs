// =============================================================================
// Market data primitives
// =============================================================================

use serde::{Deserialize, Serialize};

/// A closed OHLCV bar for one `(symbol, timeframe)` series.
///
/// `start_time` is milliseconds since epoch, aligned to the bucket start.
/// Bars are never mutated after insertion into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(start_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            start_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// OHLC sanity: `low <= min(open, close) <= max(open, close) <= high`,
    /// all fields finite, volume non-negative.
    pub fn is_valid(&self) -> bool {
        let vals = [self.open, self.high, self.low, self.close, self.volume];
        if vals.iter().any(|v| !v.is_finite()) {
            return false;
        }
        if self.volume < 0.0 {
            return false;
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high
    }

    /// Candle body size. Never negative.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// One executed print from the public trade feed (WS, REST fallback, or the
/// historical tick archive). `time_ms` is the execution time in ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub time_ms: i64,
    pub is_buy: bool,
    pub size: f64,
    pub price: f64,
    pub id: String,
    pub seq: i64,
}

/// A `(price, size)` depth level. Bids sort descending, asks ascending.
pub type BookLevel = (f64, f64);

/// Point-in-time view of the order book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    /// Sorted descending by price.
    pub bids: Vec<BookLevel>,
    /// Sorted ascending by price.
    pub asks: Vec<BookLevel>,
    pub ts: i64,
    pub update_id: i64,
    pub seq: i64,
}

impl BookSnapshot {
    /// Mid price from the best bid/ask, if both sides are present.
    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?.0;
        let ask = self.asks.first()?.0;
        Some((bid + ask) / 2.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_validity() {
        let good = Candle::new(0, 100.0, 105.0, 95.0, 102.0, 10.0);
        assert!(good.is_valid());

        let inverted = Candle::new(0, 100.0, 95.0, 105.0, 102.0, 10.0);
        assert!(!inverted.is_valid());

        let nan = Candle::new(0, 100.0, f64::NAN, 95.0, 102.0, 10.0);
        assert!(!nan.is_valid());

        let neg_vol = Candle::new(0, 100.0, 105.0, 95.0, 102.0, -1.0);
        assert!(!neg_vol.is_valid());
    }

    #[test]
    fn wick_geometry() {
        let c = Candle::new(0, 100.0, 110.0, 90.0, 104.0, 1.0);
        assert!((c.body() - 4.0).abs() < 1e-12);
        assert!((c.lower_wick() - 10.0).abs() < 1e-12);
        assert!((c.upper_wick() - 6.0).abs() < 1e-12);
        assert!(c.is_bullish());
    }

    #[test]
    fn mid_price_requires_both_sides() {
        let mut snap = BookSnapshot::default();
        assert_eq!(snap.mid_price(), None);
        snap.bids = vec![(99.0, 1.0)];
        snap.asks = vec![(101.0, 2.0)];
        assert_eq!(snap.mid_price(), Some(100.0));
    }
}
