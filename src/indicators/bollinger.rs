// =============================================================================
// Bollinger band width
// =============================================================================

use crate::market_data::Candle;

/// Relative band width: `(upper - lower) / ma = 2 * mult * stdev / ma`
/// over the last `period` closes. Returns `None` on insufficient data or a
/// non-positive mean.
pub fn bb_width(candles: &[Candle], period: usize, mult: f64) -> Option<f64> {
    if period < 2 || candles.len() < period {
        return None;
    }
    let closes: Vec<f64> = candles[candles.len() - period..]
        .iter()
        .map(|c| c.close)
        .collect();
    let ma = closes.iter().sum::<f64>() / period as f64;
    if !(ma > 0.0) {
        return None;
    }
    let variance = closes.iter().map(|c| (c - ma).powi(2)).sum::<f64>() / period as f64;
    let stdev = variance.sqrt();
    let width = 2.0 * mult * stdev / ma;
    if width.is_finite() {
        Some(width)
    } else {
        None
    }
}
