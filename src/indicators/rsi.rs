// =============================================================================
// Relative Strength Index + two-half-window divergence
// =============================================================================

use crate::market_data::Candle;

/// RSI (0..100) over closes, averaging gains/losses across the last
/// `period` bar-to-bar changes. Returns `None` on insufficient data;
/// returns 100 when there are no losses in the window.
pub fn rsi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut gains = 0.0;
    let mut losses = 0.0;
    let start = closes.len() - period;
    for i in start..closes.len() {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    if avg_loss <= 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Simplified RSI divergence over two adjacent half-windows of `window` bars.
///
/// Bullish: price makes a lower low across the halves while RSI makes a
/// higher low. Bearish: price higher high while RSI lower high.
/// Returns `(bullish, bearish)`; `(false, false)` on insufficient data.
pub fn rsi_divergence(candles: &[Candle], period: usize, window: usize) -> (bool, bool) {
    if candles.len() < 2 * window || 2 * window < period + 2 {
        return (false, false);
    }
    let prev = &candles[candles.len() - 2 * window..candles.len() - window];
    let recent = &candles[candles.len() - window..];
    if prev.len() < period + 1 || recent.len() < period + 1 {
        return (false, false);
    }
    let low_prev = prev.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let low_recent = recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let high_prev = prev.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let high_recent = recent
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);

    let (Some(rsi_prev), Some(rsi_recent)) = (rsi(prev, period), rsi(recent, period)) else {
        return (false, false);
    };

    let bullish = low_recent < low_prev && rsi_recent > rsi_prev;
    let bearish = high_recent > high_prev && rsi_recent < rsi_prev;
    (bullish, bearish)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle::new(0, close, close + 0.5, close - 0.5, close, 10.0)
    }

    fn candle_hl(close: f64, high: f64, low: f64) -> Candle {
        Candle::new(0, close, high, low, close, 10.0)
    }

    #[test]
    fn rsi_insufficient_data() {
        let candles = vec![candle(100.0); 10];
        assert_eq!(rsi(&candles, 14), None);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(100.0 + i as f64)).collect();
        assert!((rsi(&candles, 14).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_near_zero() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(200.0 - i as f64)).collect();
        assert!(rsi(&candles, 14).unwrap() < 1.0);
    }

    #[test]
    fn rsi_balanced_near_50() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| candle(if i % 2 == 0 { 100.0 } else { 101.0 }))
            .collect();
        let value = rsi(&candles, 14).unwrap();
        assert!((value - 50.0).abs() < 10.0, "got {value}");
    }

    #[test]
    fn divergence_bullish_lower_low_stronger_rsi() {
        // Previous half: steady decline to a low of ~80.
        // Recent half: marginal new low but closes recovering (higher RSI).
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| candle_hl(100.0 - i as f64, 101.0 - i as f64, 99.0 - i as f64))
            .collect();
        candles.extend((0..20).map(|i| {
            let close = 82.0 + i as f64 * 0.6;
            let low = if i == 0 { 78.5 } else { close - 1.0 };
            candle_hl(close, close + 1.0, low)
        }));
        let (bullish, bearish) = rsi_divergence(&candles, 14, 20);
        assert!(bullish);
        assert!(!bearish);
    }

    #[test]
    fn divergence_insufficient_data() {
        let candles = vec![candle(100.0); 10];
        assert_eq!(rsi_divergence(&candles, 14, 20), (false, false));
    }
}
