// =============================================================================
// Window structure: swings, returns, range position, spring/upthrust
// =============================================================================

use crate::market_data::Candle;
use crate::types::Structure;

/// Tolerance for "equal" swing comparisons: 0.2% either way.
const SWING_TOLERANCE: f64 = 0.002;

/// Classify the window into up (HH+HL), down (LH+LL), or range by dividing
/// it into `pivots` buckets and comparing per-bucket extremes.
pub fn bucket_structure(candles: &[Candle], pivots: usize) -> Structure {
    if pivots == 0 || candles.len() < pivots * 2 {
        return Structure::Range;
    }
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let step = (lows.len() / pivots).max(1);

    let bucket_mins: Vec<f64> = (0..=lows.len() - step)
        .step_by(step)
        .map(|i| lows[i..i + step].iter().fold(f64::INFINITY, |a, &b| a.min(b)))
        .collect();
    let bucket_maxs: Vec<f64> = (0..=highs.len() - step)
        .step_by(step)
        .map(|i| {
            highs[i..i + step]
                .iter()
                .fold(f64::NEG_INFINITY, |a, &b| a.max(b))
        })
        .collect();

    let last_lows = &bucket_mins[bucket_mins.len().saturating_sub(pivots)..];
    let last_highs = &bucket_maxs[bucket_maxs.len().saturating_sub(pivots)..];
    if last_lows.is_empty() || last_highs.is_empty() {
        return Structure::Range;
    }

    let rising = |s: &[f64]| {
        s.windows(2)
            .all(|w| w[1] >= w[0] * (1.0 - SWING_TOLERANCE))
    };
    let falling = |s: &[f64]| {
        s.windows(2)
            .all(|w| w[1] <= w[0] * (1.0 + SWING_TOLERANCE))
    };

    if rising(last_lows) && rising(last_highs) {
        Structure::Up
    } else if falling(last_lows) && falling(last_highs) {
        Structure::Down
    } else {
        Structure::Range
    }
}

/// Directional share of close-to-close movement over the last `period`
/// transitions: `|up - down| / (up + down)` in `[0, 1]`. High = trending.
pub fn trend_strength(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let closes: Vec<f64> = candles[candles.len() - period - 1..]
        .iter()
        .map(|c| c.close)
        .collect();
    let mut up = 0.0;
    let mut down = 0.0;
    for w in closes.windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            up += change;
        } else {
            down -= change;
        }
    }
    let total = up + down;
    if total <= 0.0 {
        return Some(0.0);
    }
    Some((up - down).abs() / total)
}

/// Relative price change over the last `bars` candles (fraction, not %).
pub fn recent_return(candles: &[Candle], bars: usize) -> Option<f64> {
    if bars == 0 || candles.len() < bars + 1 {
        return None;
    }
    let old = candles[candles.len() - bars - 1].close;
    let new = candles[candles.len() - 1].close;
    if !(old > 0.0) {
        return None;
    }
    Some((new - old) / old)
}

/// Position of the last close inside the `[min low, max high]` range of the
/// last `lookback` candles: 0 = at the bottom, 1 = at the top.
pub fn price_position_in_range(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback {
        return None;
    }
    let recent = &candles[candles.len() - lookback..];
    let r_min = recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let r_max = recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let last_close = recent.last()?.close;
    if r_max <= r_min {
        return Some(0.5);
    }
    Some((last_close - r_min) / (r_max - r_min))
}

/// Wyckoff spring / upthrust: the last `tail` bars pierced the range built
/// by the preceding `lookback - tail` bars by at least `break_pct * span`
/// and the final close returned inside the range.
/// Returns `(spring, upthrust)`.
pub fn spring_upthrust(
    candles: &[Candle],
    lookback: usize,
    tail: usize,
    break_pct: f64,
) -> (bool, bool) {
    if candles.len() < lookback || lookback <= tail || tail == 0 {
        return (false, false);
    }
    let base = &candles[candles.len() - lookback..candles.len() - tail];
    let last = &candles[candles.len() - tail..];
    let r_min = base.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let r_max = base.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let span = r_max - r_min;
    if span <= 0.0 {
        return (false, false);
    }
    let margin = break_pct * span;
    let last_min_low = last.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let last_max_high = last.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let close = candles[candles.len() - 1].close;
    let inside = (r_min..=r_max).contains(&close);
    let spring = last_min_low <= r_min - margin && inside;
    let upthrust = last_max_high >= r_max + margin && inside;
    (spring, upthrust)
}

/// Freshness of the move into a range bound: of the last 3 closes at least
/// 2 sit inside the band while of the 3 before them at most 1 did.
/// Returns `(fresh_low, fresh_high)`.
pub fn zone_freshness(candles: &[Candle], lookback: usize, band: f64) -> (bool, bool) {
    if candles.len() < lookback || lookback < 8 {
        return (false, false);
    }
    let recent = &candles[candles.len() - lookback..];
    let r_min = recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let r_max = recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if r_max <= r_min {
        return (false, false);
    }
    let low_bound = r_min + band * (r_max - r_min);
    let high_bound = r_max - band * (r_max - r_min);
    let last_3 = &candles[candles.len() - 3..];
    let prev_3 = &candles[candles.len() - 6..candles.len() - 3];
    let in_low = |seq: &[Candle]| seq.iter().filter(|c| c.close <= low_bound).count();
    let in_high = |seq: &[Candle]| seq.iter().filter(|c| c.close >= high_bound).count();
    let fresh_low = in_low(last_3) >= 2 && in_low(prev_3) <= 1;
    let fresh_high = in_high(last_3) >= 2 && in_high(prev_3) <= 1;
    (fresh_low, fresh_high)
}
