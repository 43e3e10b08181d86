// =============================================================================
// Pivot extraction
// =============================================================================

use crate::market_data::Candle;

/// A local extremum: `(price, bar_index)`.
pub type Pivot = (f64, usize);

/// Local maxima: `high[i]` is >= every high in `[i-left, i+right]`.
/// Flat tops can yield adjacent pivots; the zone model clusters them.
pub fn pivot_highs(candles: &[Candle], left: usize, right: usize) -> Vec<Pivot> {
    if candles.len() < left + right + 1 {
        return Vec::new();
    }
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let mut out = Vec::new();
    for i in left..highs.len() - right {
        let window_max = highs[i - left..=i + right]
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        if highs[i] >= window_max {
            out.push((highs[i], i));
        }
    }
    out
}

/// Local minima: `low[i]` is <= every low in `[i-left, i+right]`.
pub fn pivot_lows(candles: &[Candle], left: usize, right: usize) -> Vec<Pivot> {
    if candles.len() < left + right + 1 {
        return Vec::new();
    }
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let mut out = Vec::new();
    for i in left..lows.len() - right {
        let window_min = lows[i - left..=i + right]
            .iter()
            .fold(f64::INFINITY, |a, &b| a.min(b));
        if lows[i] <= window_min {
            out.push((lows[i], i));
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        let mid = (high + low) / 2.0;
        Candle::new(0, mid, high, low, mid, 1.0)
    }

    #[test]
    fn finds_single_peak_and_trough() {
        // Highs rise to 20 at index 5 then fall; lows dip to 10 there.
        let candles: Vec<Candle> = (0..11)
            .map(|i| {
                let dist = (i as i64 - 5).unsigned_abs() as f64;
                candle(20.0 - dist, 10.0 + dist)
            })
            .collect();
        let highs = pivot_highs(&candles, 3, 3);
        assert_eq!(highs, vec![(20.0, 5)]);
        let lows = pivot_lows(&candles, 3, 3);
        assert_eq!(lows, vec![(10.0, 5)]);
    }

    #[test]
    fn window_too_short_yields_nothing() {
        let candles = vec![candle(10.0, 9.0); 5];
        assert!(pivot_highs(&candles, 3, 3).is_empty());
        assert!(pivot_lows(&candles, 3, 3).is_empty());
    }

    #[test]
    fn flat_region_yields_adjacent_pivots() {
        let candles = vec![candle(10.0, 9.0); 9];
        let highs = pivot_highs(&candles, 2, 2);
        assert_eq!(highs.len(), 5); // indices 2..=6
        assert!(highs.iter().all(|&(p, _)| (p - 10.0).abs() < 1e-12));
    }
}
