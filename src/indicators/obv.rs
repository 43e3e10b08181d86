// =============================================================================
// On-Balance Volume slope (normalized)
// =============================================================================

use crate::market_data::Candle;

/// Normalized OBV slope over the last `period` bar transitions.
///
/// Sums signed volume (positive on up-closes, negative on down-closes) and
/// divides by total volume in the window, yielding a value in `[-1, 1]`:
/// +1 = every bar closed higher, -1 = every bar closed lower.
/// Returns `None` on insufficient data or zero volume.
pub fn obv_slope(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period - 1..];
    let mut signed = 0.0;
    let mut total = 0.0;
    for i in 1..window.len() {
        let vol = window[i].volume;
        total += vol;
        if window[i].close > window[i - 1].close {
            signed += vol;
        } else if window[i].close < window[i - 1].close {
            signed -= vol;
        }
    }
    if !(total > 0.0) || !signed.is_finite() {
        return None;
    }
    Some(signed / total)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new(0, close, close + 1.0, close - 1.0, close, volume)
    }

    #[test]
    fn slope_plus_one_on_straight_rise() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(100.0 + i as f64, 5.0)).collect();
        assert!((obv_slope(&candles, 14).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn slope_minus_one_on_straight_fall() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(200.0 - i as f64, 5.0)).collect();
        assert!((obv_slope(&candles, 14).unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn slope_zero_on_alternating_equal_volume() {
        let candles: Vec<Candle> = (0..21)
            .map(|i| candle(if i % 2 == 0 { 100.0 } else { 101.0 }, 5.0))
            .collect();
        let slope = obv_slope(&candles, 14).unwrap();
        assert!(slope.abs() < 0.15, "got {slope}");
    }

    #[test]
    fn slope_insufficient_data() {
        let candles = vec![candle(100.0, 5.0); 10];
        assert_eq!(obv_slope(&candles, 14), None);
    }
}
