// =============================================================================
// Price-action phase classifier — pivots, BOS, CHOCH
// =============================================================================
//
// Pure market structure: swing pivots, Break of Structure (a new extreme in
// the direction of the prior trend), and Change of Character (the first
// counter-swing after a trend). No indicators, no volume-at-bounds.
// =============================================================================

use crate::indicators::{clip_score, pivot_highs, pivot_lows, recent_return, round_to, volume_ratio};
use crate::market_data::Candle;
use crate::types::{Phase, Structure, Timeframe};

use super::phases::{
    apply_higher_tf_context, PhaseContext, PhaseDetails, PhaseParams, PhaseResult, PhaseSettings,
};

const SWING_TOLERANCE: f64 = 0.002;

/// Structure from the last `min_pivots` swings of each kind.
fn structure_from_pivots(
    highs: &[(f64, usize)],
    lows: &[(f64, usize)],
    min_pivots: usize,
) -> Structure {
    if highs.len() < min_pivots || lows.len() < min_pivots {
        return Structure::Range;
    }
    let last_highs: Vec<f64> = highs[highs.len() - min_pivots..].iter().map(|p| p.0).collect();
    let last_lows: Vec<f64> = lows[lows.len() - min_pivots..].iter().map(|p| p.0).collect();
    let hh = last_highs
        .windows(2)
        .all(|w| w[1] >= w[0] * (1.0 - SWING_TOLERANCE));
    let hl = last_lows
        .windows(2)
        .all(|w| w[1] >= w[0] * (1.0 - SWING_TOLERANCE));
    let lh = last_highs
        .windows(2)
        .all(|w| w[1] <= w[0] * (1.0 + SWING_TOLERANCE));
    let ll = last_lows
        .windows(2)
        .all(|w| w[1] <= w[0] * (1.0 + SWING_TOLERANCE));
    if hh && hl {
        Structure::Up
    } else if lh && ll {
        Structure::Down
    } else {
        Structure::Range
    }
}

/// `(bos_up, bos_down, choch_bullish, choch_bearish)` from the last bar
/// against the latest swings.
fn bos_choch(
    candles: &[Candle],
    highs: &[(f64, usize)],
    lows: &[(f64, usize)],
    structure: Structure,
) -> (bool, bool, bool, bool) {
    let (Some(last), Some(&(last_swing_high, _)), Some(&(last_swing_low, _))) =
        (candles.last(), highs.last(), lows.last())
    else {
        return (false, false, false, false);
    };
    let bos_up = last.high > last_swing_high || last.close > last_swing_high;
    let bos_down = last.low < last_swing_low || last.close < last_swing_low;

    let choch_bullish = structure == Structure::Down
        && lows.len() >= 2
        && lows[lows.len() - 1].0 > lows[lows.len() - 2].0;
    let choch_bearish = structure == Structure::Up
        && highs.len() >= 2
        && highs[highs.len() - 1].0 < highs[highs.len() - 2].0;

    (bos_up, bos_down, choch_bullish, choch_bearish)
}

pub fn detect_phase(
    candles: &[Candle],
    tf: Option<Timeframe>,
    ctx: &PhaseContext,
    settings: &PhaseSettings,
) -> PhaseResult {
    if candles.len() < 40 {
        return PhaseResult::insufficient();
    }
    let params = PhaseParams::for_timeframe(tf);
    let c = if candles.len() > settings.lookback {
        &candles[candles.len() - settings.lookback..]
    } else {
        candles
    };

    let highs = pivot_highs(c, 2, 2);
    let lows = pivot_lows(c, 2, 2);
    let structure = structure_from_pivots(&highs, &lows, 3);
    let (bos_up, bos_down, choch_bullish, choch_bearish) = bos_choch(c, &highs, &lows, structure);

    let ret_5 = recent_return(c, 5);
    let ret_20 = recent_return(c, 20.min(c.len() - 1));
    let vol_ratio = volume_ratio(c, 3, 20);
    let r5 = ret_5.unwrap_or(0.0);
    let r20 = ret_20.unwrap_or(0.0);
    let vol = vol_ratio.unwrap_or(1.0);

    let details = PhaseDetails {
        structure: Some(structure),
        volume_ratio: vol_ratio.map(|v| round_to(v, 3)),
        return_5: ret_5.map(|v| round_to(v, 4)),
        return_20: ret_20.map(|v| round_to(v, 4)),
        ..PhaseDetails::default()
    };

    let mut candidates: Vec<(Phase, f64)> = Vec::new();
    let push = |phase: Phase, score: f64, candidates: &mut Vec<(Phase, f64)>| {
        candidates.push((phase, apply_higher_tf_context(phase, clip_score(score), ctx)));
    };

    // Capitulation: terminal flush inside a downtrend, no CHOCH yet.
    if r5 <= params.drop_threshold
        && vol >= params.vol_spike
        && structure == Structure::Down
        && !choch_bullish
    {
        let sc = (r5.abs() * 4.0 + (vol - 1.0) * 0.15).min(1.0);
        push(Phase::Capitulation, sc, &mut candidates);
    }

    // Recovery: bullish CHOCH after a downtrend plus a bounce.
    if choch_bullish && (r5 > 0.005 || r20 < -0.02) {
        let sc = 0.55 + 0.2 * (r5.max(0.0) / 0.02).min(1.0) + if bos_up { 0.1 } else { 0.0 };
        push(Phase::Recovery, sc, &mut candidates);
    }

    // Markup / markdown on a confirmed break.
    if structure == Structure::Up && bos_up {
        let bonus = if ret_20.is_some_and(|r| r >= -0.01) { 0.5 } else { 0.0 };
        push(Phase::Markup, 0.65 + 0.2 * (0.5 + bonus), &mut candidates);
    }
    if structure == Structure::Down && bos_down && !choch_bullish {
        let bonus = if ret_20.is_some_and(|r| r <= 0.01) { 0.5 } else { 0.0 };
        push(Phase::Markdown, 0.65 + 0.2 * (0.5 + bonus), &mut candidates);
    }

    // Accumulation / distribution: CHOCH without a confirming break yet.
    if choch_bullish && !bos_up {
        push(
            Phase::Accumulation,
            0.5 + 0.2 * (r5.max(0.0) / 0.01).min(1.0),
            &mut candidates,
        );
    }
    if choch_bearish && !bos_down {
        push(
            Phase::Distribution,
            0.5 + 0.2 * ((-r5).max(0.0) / 0.01).min(1.0),
            &mut candidates,
        );
    }

    // Fallback by structure alone.
    if candidates.is_empty() {
        match structure {
            Structure::Up => {
                let bonus = if ret_20.is_some_and(|r| r > -0.02) { 0.15 } else { 0.0 };
                push(Phase::Markup, 0.45 + bonus, &mut candidates);
            }
            Structure::Down => {
                let bonus = if ret_20.is_some_and(|r| r < 0.02) { 0.15 } else { 0.0 };
                push(Phase::Markdown, 0.45 + bonus, &mut candidates);
            }
            Structure::Range => push(Phase::Accumulation, 0.35, &mut candidates),
        }
    }

    PhaseResult::from_candidates(candidates, details, settings)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(i, open, high, low, close, 10.0)
    }

    /// Zig-zag uptrend: rising swing highs and lows with a final breakout.
    fn uptrend_with_bos() -> Vec<Candle> {
        let mut candles = Vec::new();
        for leg in 0..10 {
            let base = 100.0 + leg as f64 * 4.0;
            for j in 0..5 {
                let wobble = [0.0, 1.5, 3.0, 1.5, 0.5][j];
                let price = base + wobble;
                candles.push(candle(
                    (leg * 5 + j) as i64,
                    price,
                    price + 0.8,
                    price - 0.8,
                    price + 0.4,
                ));
            }
        }
        // Final bar breaks the last swing high decisively.
        let n = candles.len() as i64;
        candles.push(candle(n, 142.0, 150.0, 141.0, 149.0));
        candles
    }

    #[test]
    fn bos_in_uptrend_is_markup() {
        let result = detect_phase(
            &uptrend_with_bos(),
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(result.phase, Phase::Markup);
        assert!(result.score >= 0.65);
    }

    #[test]
    fn downtrend_with_breakdown_is_markdown() {
        let up = uptrend_with_bos();
        // Mirror vertically around 125 to get the bearish twin.
        let down: Vec<Candle> = up
            .iter()
            .map(|c| {
                Candle::new(
                    c.start_time,
                    250.0 - c.open,
                    250.0 - c.low,
                    250.0 - c.high,
                    250.0 - c.close,
                    c.volume,
                )
            })
            .collect();
        let result = detect_phase(
            &down,
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(result.phase, Phase::Markdown);
    }

    #[test]
    fn structure_helper_classifies_pivot_series() {
        let rising = vec![(100.0, 1), (104.0, 5), (108.0, 9)];
        let rising_lows = vec![(98.0, 3), (102.0, 7), (106.0, 11)];
        assert_eq!(structure_from_pivots(&rising, &rising_lows, 3), Structure::Up);

        let falling: Vec<(f64, usize)> = rising.iter().map(|&(p, i)| (220.0 - p, i)).collect();
        let falling_lows: Vec<(f64, usize)> =
            rising_lows.iter().map(|&(p, i)| (220.0 - p, i)).collect();
        assert_eq!(
            structure_from_pivots(&falling, &falling_lows, 3),
            Structure::Down
        );
    }

    #[test]
    fn short_window_insufficient() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect();
        let result = detect_phase(
            &candles,
            None,
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert!(result.unclear);
    }
}
