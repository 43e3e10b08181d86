// =============================================================================
// Average True Range (analysis-layer form)
// =============================================================================
//
// The analyzer uses the simplified true range `high - low`: the archive only
// holds closed bars of one series, and bar-to-bar gaps on a perpetual are
// negligible against intrabar range. ATR here is the mean of the last
// `period` ranges.
// =============================================================================

use crate::market_data::Candle;

/// Mean `high - low` over the last `period` candles.
///
/// Returns `None` when `period` is zero, the window is too short, or the
/// result is non-finite.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let recent = &candles[candles.len() - period..];
    let sum: f64 = recent.iter().map(|c| c.high - c.low).sum();
    let value = sum / period as f64;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        let mid = (high + low) / 2.0;
        Candle::new(0, mid, high, low, mid, 10.0)
    }

    #[test]
    fn atr_insufficient_data() {
        let candles = vec![candle(105.0, 95.0); 5];
        assert_eq!(atr(&candles, 14), None);
        assert_eq!(atr(&candles, 0), None);
    }

    #[test]
    fn atr_constant_range() {
        let candles = vec![candle(105.0, 95.0); 30];
        let value = atr(&candles, 14).unwrap();
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn atr_uses_only_the_tail() {
        let mut candles = vec![candle(200.0, 100.0); 20]; // wide, old
        candles.extend(vec![candle(101.0, 100.0); 14]); // narrow, recent
        let value = atr(&candles, 14).unwrap();
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn atr_nan_returns_none() {
        let mut candles = vec![candle(105.0, 95.0); 14];
        candles[7].high = f64::NAN;
        assert_eq!(atr(&candles, 14), None);
    }
}
