// =============================================================================
// Volume-derived measures
// =============================================================================

use crate::market_data::Candle;

/// Ratio of the mean volume over the last `short` candles to the mean over
/// the last `long` candles. Above 1 = recent activity above baseline.
pub fn volume_ratio(candles: &[Candle], short: usize, long: usize) -> Option<f64> {
    if short == 0 || long == 0 || candles.len() < long {
        return None;
    }
    let vols: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let avg_short = vols[vols.len() - short..].iter().sum::<f64>() / short as f64;
    let avg_long = vols[vols.len() - long..].iter().sum::<f64>() / long as f64;
    if !(avg_long > 0.0) {
        return None;
    }
    Some(avg_short / avg_long)
}

/// Mean volume over up to `period` bars ending at `end_idx` (inclusive).
/// Used by the zone role-confirmation pass.
pub fn volume_ma_at(candles: &[Candle], end_idx: usize, period: usize) -> f64 {
    if candles.is_empty() || end_idx >= candles.len() || period == 0 {
        return 0.0;
    }
    let start = end_idx.saturating_sub(period - 1);
    let window = &candles[start..=end_idx];
    window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64
}

/// Mean-volume ratios at the range bounds: candles whose low touches the
/// bottom `band` of the window range vs the overall mean, and symmetrically
/// at the top. `> 1` at the low supports accumulation, at the high supports
/// distribution. Returns `(ratio_at_low, ratio_at_high)`.
pub fn volume_at_range_bounds(
    candles: &[Candle],
    lookback: usize,
    band: f64,
) -> (Option<f64>, Option<f64>) {
    if candles.len() < lookback || lookback == 0 {
        return (None, None);
    }
    let recent = &candles[candles.len() - lookback..];
    let r_min = recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let r_max = recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if r_max <= r_min {
        return (None, None);
    }
    let span = r_max - r_min;
    let low_bound = r_min + band * span;
    let high_bound = r_max - band * span;
    let avg_all = recent.iter().map(|c| c.volume).sum::<f64>() / recent.len() as f64;
    if !(avg_all > 0.0) {
        return (None, None);
    }
    let at_low: Vec<f64> = recent
        .iter()
        .filter(|c| c.low <= low_bound)
        .map(|c| c.volume)
        .collect();
    let at_high: Vec<f64> = recent
        .iter()
        .filter(|c| c.high >= high_bound)
        .map(|c| c.volume)
        .collect();
    let ratio_low = if at_low.is_empty() {
        None
    } else {
        Some(at_low.iter().sum::<f64>() / at_low.len() as f64 / avg_all)
    };
    let ratio_high = if at_high.is_empty() {
        None
    } else {
        Some(at_high.iter().sum::<f64>() / at_high.len() as f64 / avg_all)
    };
    (ratio_low, ratio_high)
}

/// Who is more active at the bounds: mean bull-candle volume over mean
/// bear-candle volume in the bottom band (buying pressure at the low), and
/// mean bear over mean bull in the top band (selling pressure at the high).
/// Returns `(buying_pressure_low, selling_pressure_high)`.
pub fn volume_pressure_at_bounds(
    candles: &[Candle],
    lookback: usize,
    band: f64,
) -> (Option<f64>, Option<f64>) {
    if candles.len() < lookback || lookback == 0 {
        return (None, None);
    }
    let recent = &candles[candles.len() - lookback..];
    let r_min = recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let r_max = recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if r_max <= r_min {
        return (None, None);
    }
    let span = r_max - r_min;
    let low_bound = r_min + band * span;
    let high_bound = r_max - band * span;

    let mean = |v: &[f64]| -> Option<f64> {
        if v.is_empty() {
            None
        } else {
            Some(v.iter().sum::<f64>() / v.len() as f64)
        }
    };

    let bull_low: Vec<f64> = recent
        .iter()
        .filter(|c| c.low <= low_bound && c.close > c.open)
        .map(|c| c.volume)
        .collect();
    let bear_low: Vec<f64> = recent
        .iter()
        .filter(|c| c.low <= low_bound && c.close <= c.open)
        .map(|c| c.volume)
        .collect();
    let bull_high: Vec<f64> = recent
        .iter()
        .filter(|c| c.high >= high_bound && c.close > c.open)
        .map(|c| c.volume)
        .collect();
    let bear_high: Vec<f64> = recent
        .iter()
        .filter(|c| c.high >= high_bound && c.close <= c.open)
        .map(|c| c.volume)
        .collect();

    let buying = match (mean(&bull_low), mean(&bear_low)) {
        (Some(bull), Some(bear)) if bear > 0.0 => Some(bull / bear),
        _ => None,
    };
    let selling = match (mean(&bear_high), mean(&bull_high)) {
        (Some(bear), Some(bull)) if bull > 0.0 => Some(bear / bull),
        _ => None,
    };
    (buying, selling)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new(0, open, high, low, close, volume)
    }

    #[test]
    fn volume_ratio_spike() {
        let mut candles = vec![candle(100.0, 101.0, 99.0, 100.0, 10.0); 20];
        let n = candles.len();
        for c in candles[n - 3..].iter_mut() {
            c.volume = 30.0;
        }
        let ratio = volume_ratio(&candles, 3, 20).unwrap();
        assert!(ratio > 2.0, "got {ratio}");
    }

    #[test]
    fn volume_ma_window_is_inclusive() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| candle(1.0, 2.0, 0.5, 1.0, i as f64))
            .collect();
        // Bars 5..=9 → volumes 5,6,7,8,9 → mean 7.
        assert!((volume_ma_at(&candles, 9, 5) - 7.0).abs() < 1e-9);
        // Short history clamps at zero.
        assert!((volume_ma_at(&candles, 2, 5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bounds_ratio_sees_heavy_lows() {
        // Range 90..110; candles at the low carry triple volume.
        let mut candles = Vec::new();
        for i in 0..50 {
            if i % 5 == 0 {
                candles.push(candle(92.0, 93.0, 90.0, 92.5, 30.0));
            } else {
                candles.push(candle(100.0, 110.0, 99.0, 105.0, 10.0));
            }
        }
        let (at_low, _) = volume_at_range_bounds(&candles, 50, 0.15);
        assert!(at_low.unwrap() > 1.5);
    }

    #[test]
    fn pressure_detects_buyers_at_low() {
        let mut candles = Vec::new();
        for i in 0..50 {
            if i % 4 == 0 {
                // bullish candle at the low, heavy volume
                candles.push(candle(91.0, 93.0, 90.0, 92.5, 40.0));
            } else if i % 4 == 1 {
                // bearish candle at the low, light volume
                candles.push(candle(92.0, 93.0, 90.0, 91.0, 10.0));
            } else {
                candles.push(candle(100.0, 110.0, 99.0, 105.0, 10.0));
            }
        }
        let (buying, _) = volume_pressure_at_bounds(&candles, 50, 0.15);
        assert!(buying.unwrap() > 2.0);
    }

    #[test]
    fn degenerate_range_returns_none() {
        let candles = vec![candle(100.0, 100.0, 100.0, 100.0, 10.0); 50];
        assert_eq!(volume_at_range_bounds(&candles, 50, 0.15), (None, None));
    }
}
