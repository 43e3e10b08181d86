// =============================================================================
// Rolling VWAP
// =============================================================================

use crate::market_data::Candle;

/// Volume-weighted average price over the last `n` candles (typical price
/// `(H+L+C)/3` weighted by volume), plus the relative distance of the last
/// close from it: `(close - vwap) / vwap`.
///
/// Returns `None` when the window is empty or total volume is zero.
pub fn vwap_rolling(candles: &[Candle], n: usize) -> Option<(f64, f64)> {
    if n == 0 || candles.is_empty() {
        return None;
    }
    let window = &candles[candles.len().saturating_sub(n)..];
    let mut pv = 0.0;
    let mut vol = 0.0;
    for c in window {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        vol += c.volume;
    }
    if !(vol > 0.0) || !pv.is_finite() {
        return None;
    }
    let vwap = pv / vol;
    if !(vwap > 0.0) {
        return None;
    }
    let close = window.last()?.close;
    Some((vwap, (close - vwap) / vwap))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new(0, close, close, close, close, volume)
    }

    #[test]
    fn vwap_equal_volumes_is_mean_of_typical() {
        let candles = vec![candle(100.0, 1.0), candle(200.0, 1.0)];
        let (vwap, dist) = vwap_rolling(&candles, 2).unwrap();
        assert!((vwap - 150.0).abs() < 1e-9);
        assert!((dist - (200.0 - 150.0) / 150.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_weighted_toward_heavy_bar() {
        let candles = vec![candle(100.0, 9.0), candle(200.0, 1.0)];
        let (vwap, _) = vwap_rolling(&candles, 2).unwrap();
        assert!((vwap - 110.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_zero_volume_is_none() {
        let candles = vec![candle(100.0, 0.0); 5];
        assert_eq!(vwap_rolling(&candles, 5), None);
    }
}
