// =============================================================================
// Market phase classification — Wyckoff-style default classifier
// =============================================================================
//
// Six phases: accumulation, markup, distribution, markdown, capitulation,
// recovery. The Wyckoff classifier walks a fixed decision order; every
// branch whose condition holds becomes a candidate `(phase, score)`. The
// first candidate is the chosen phase (order is part of the contract), the
// strongest later candidate becomes the secondary phase for the score gap.
//
// Higher-timeframe context nudges a directional candidate's score by ±0.04
// when the higher TF agrees/disagrees; accumulation is left untouched.
// =============================================================================

use serde::Serialize;

use crate::config::PhaseMethod;
use crate::indicators::{
    atr, bucket_structure, clip_score, price_position_in_range, recent_return, round_to, rsi,
    rsi_divergence, spring_upthrust, trend_strength, volume_at_range_bounds,
    volume_pressure_at_bounds, volume_ratio, zone_freshness,
};
use crate::market_data::Candle;
use crate::types::{Phase, Structure, TfProfile, Timeframe, TrendDirection};

use super::{phase_indicators, phase_structure};

/// Context-agreement nudge applied to directional phases.
const CONTEXT_ADJUST: f64 = 0.04;

/// Per-timeframe threshold profile. Short TFs are noisier and use looser
/// thresholds than H1 and above.
#[derive(Debug, Clone, Copy)]
pub struct PhaseParams {
    pub vol_spike: f64,
    pub drop_threshold: f64,
    pub range_position_low: f64,
    pub range_position_high: f64,
}

impl PhaseParams {
    pub fn for_timeframe(tf: Option<Timeframe>) -> Self {
        match tf.map(|t| t.profile()) {
            Some(TfProfile::Short) => Self {
                vol_spike: 2.0,
                drop_threshold: -0.04,
                range_position_low: 0.30,
                range_position_high: 0.70,
            },
            Some(TfProfile::Long) => Self {
                vol_spike: 1.6,
                drop_threshold: -0.06,
                range_position_low: 0.35,
                range_position_high: 0.65,
            },
            None => Self {
                vol_spike: 1.8,
                drop_threshold: -0.05,
                range_position_low: 0.35,
                range_position_high: 0.65,
            },
        }
    }
}

/// Higher-TF context injected on the second coordinator pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseContext {
    pub higher_tf_phase: Option<Phase>,
    pub higher_tf_trend: Option<TrendDirection>,
}

/// Classifier thresholds shared by all three methods.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSettings {
    pub lookback: usize,
    pub min_score: f64,
    pub min_gap: f64,
    pub method: PhaseMethod,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            lookback: 100,
            min_score: 0.6,
            min_gap: 0.1,
            method: PhaseMethod::Wyckoff,
        }
    }
}

/// Diagnostic feature readout included in every result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseDetails {
    pub structure: Option<Structure>,
    pub position_in_range: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub volume_at_low: Option<f64>,
    pub volume_at_high: Option<f64>,
    pub buying_pressure_low: Option<f64>,
    pub selling_pressure_high: Option<f64>,
    pub rsi_bullish_divergence: bool,
    pub rsi_bearish_divergence: bool,
    pub spring: bool,
    pub upthrust: bool,
    pub trend_strength: Option<f64>,
    pub fresh_low: bool,
    pub fresh_high: bool,
    pub atr_ratio: Option<f64>,
    pub return_5: Option<f64>,
    pub return_20: Option<f64>,
    pub rsi: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase: Phase,
    pub score: f64,
    pub secondary_phase: Option<Phase>,
    pub secondary_score: f64,
    pub score_gap: f64,
    pub unclear: bool,
    pub details: PhaseDetails,
}

impl PhaseResult {
    /// Low-information default for short windows.
    pub fn insufficient() -> Self {
        Self {
            phase: Phase::Accumulation,
            score: 0.0,
            secondary_phase: None,
            secondary_score: 0.0,
            score_gap: 0.0,
            unclear: true,
            details: PhaseDetails::default(),
        }
    }

    pub(crate) fn from_candidates(
        candidates: Vec<(Phase, f64)>,
        details: PhaseDetails,
        settings: &PhaseSettings,
    ) -> Self {
        let (phase, score) = candidates[0];
        let runner_up = candidates[1..]
            .iter()
            .filter(|(p, _)| *p != phase)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .copied();
        let (secondary_phase, secondary_score) = match runner_up {
            Some((p, s)) => (Some(p), s),
            None => (None, 0.0),
        };
        let score_gap = (score - secondary_score).max(0.0);
        let unclear = score < settings.min_score || score_gap < settings.min_gap;
        Self {
            phase,
            score,
            secondary_phase,
            secondary_score,
            score_gap,
            unclear,
            details,
        }
    }
}

/// Adjust a candidate score by the higher-TF context: +0.04 on agreement,
/// -0.04 on contradiction. Accumulation is direction-neutral and unchanged.
pub fn apply_higher_tf_context(phase: Phase, score: f64, ctx: &PhaseContext) -> f64 {
    if ctx.higher_tf_phase.is_none() && ctx.higher_tf_trend.is_none() {
        return score;
    }
    let (agree, disagree) = if phase.is_bullish() {
        (
            ctx.higher_tf_phase.is_some_and(|p| p.is_bullish())
                || ctx.higher_tf_trend == Some(TrendDirection::Up),
            ctx.higher_tf_phase.is_some_and(|p| p.is_bearish())
                || ctx.higher_tf_trend == Some(TrendDirection::Down),
        )
    } else if phase.is_bearish() {
        (
            ctx.higher_tf_phase.is_some_and(|p| p.is_bearish())
                || ctx.higher_tf_trend == Some(TrendDirection::Down),
            ctx.higher_tf_phase.is_some_and(|p| p.is_bullish())
                || ctx.higher_tf_trend == Some(TrendDirection::Up),
        )
    } else {
        return score;
    };
    if agree {
        clip_score(score + CONTEXT_ADJUST)
    } else if disagree {
        clip_score(score - CONTEXT_ADJUST)
    } else {
        score
    }
}

/// Entry point shared by all methods: dispatches on `settings.method`.
pub fn detect_phase(
    candles: &[Candle],
    tf: Option<Timeframe>,
    ctx: &PhaseContext,
    settings: &PhaseSettings,
) -> PhaseResult {
    match settings.method {
        PhaseMethod::Wyckoff => detect_phase_wyckoff(candles, tf, ctx, settings),
        PhaseMethod::Indicators => phase_indicators::detect_phase(candles, tf, ctx, settings),
        PhaseMethod::Structure => phase_structure::detect_phase(candles, tf, ctx, settings),
    }
}

/// The default classifier: structure + volume at the range bounds + RSI
/// divergence + spring/upthrust + trend strength.
pub fn detect_phase_wyckoff(
    candles: &[Candle],
    tf: Option<Timeframe>,
    ctx: &PhaseContext,
    settings: &PhaseSettings,
) -> PhaseResult {
    if candles.len() < 30 {
        return PhaseResult::insufficient();
    }
    let params = PhaseParams::for_timeframe(tf);
    let c = if candles.len() > settings.lookback {
        &candles[candles.len() - settings.lookback..]
    } else {
        candles
    };

    let structure = bucket_structure(c, 5);
    let position = price_position_in_range(c, 50.min(c.len()));
    let vol_ratio = volume_ratio(c, 3, 20);
    let atr_now = atr(c, 14);
    let atr_prev = if c.len() >= 24 {
        atr(&c[..c.len() - 10], 14)
    } else {
        atr_now
    };
    let atr_ratio = match (atr_now, atr_prev) {
        (Some(now), Some(prev)) if prev > 0.0 => now / prev,
        _ => 1.0,
    };
    let ret_5 = recent_return(c, 5);
    let ret_20 = recent_return(c, 20.min(c.len() - 1));
    let rsi_val = rsi(c, 14);
    let lb = 50.min(c.len());
    let (vol_at_low, vol_at_high) = volume_at_range_bounds(c, lb, 0.15);
    let (buying_pressure, selling_pressure) = volume_pressure_at_bounds(c, lb, 0.15);
    let (bull_div, bear_div) = rsi_divergence(c, 14, (c.len() / 2).min(20));
    let (spring, upthrust) = spring_upthrust(c, 30.min(c.len()), (c.len() / 3).min(10), 0.002);
    let ts = trend_strength(c, 14);
    let (fresh_low, fresh_high) = zone_freshness(c, 20.min(c.len()), 0.2);

    let details = PhaseDetails {
        structure: Some(structure),
        position_in_range: position.map(|v| round_to(v, 3)),
        volume_ratio: vol_ratio.map(|v| round_to(v, 3)),
        volume_at_low: vol_at_low.map(|v| round_to(v, 3)),
        volume_at_high: vol_at_high.map(|v| round_to(v, 3)),
        buying_pressure_low: buying_pressure.map(|v| round_to(v, 3)),
        selling_pressure_high: selling_pressure.map(|v| round_to(v, 3)),
        rsi_bullish_divergence: bull_div,
        rsi_bearish_divergence: bear_div,
        spring,
        upthrust,
        trend_strength: ts.map(|v| round_to(v, 3)),
        fresh_low,
        fresh_high,
        atr_ratio: Some(round_to(atr_ratio, 3)),
        return_5: ret_5.map(|v| round_to(v, 4)),
        return_20: ret_20.map(|v| round_to(v, 4)),
        rsi: rsi_val.map(|v| round_to(v, 1)),
    };

    // Defaults for the scoring arithmetic below.
    let pos = position.unwrap_or(0.5);
    let vol_low = vol_at_low.unwrap_or(1.0);
    let vol_high = vol_at_high.unwrap_or(1.0);
    let buying = buying_pressure.unwrap_or(0.0);
    let selling = selling_pressure.unwrap_or(0.0);
    let trend_str = ts.unwrap_or(0.5);
    let vol = vol_ratio.unwrap_or(1.0);
    let r5 = ret_5.unwrap_or(0.0);
    let r20 = ret_20.unwrap_or(0.0);
    let rsi_v = rsi_val.unwrap_or(50.0);

    let mut candidates: Vec<(Phase, f64)> = Vec::new();
    let push = |phase: Phase, score: f64, candidates: &mut Vec<(Phase, f64)>| {
        candidates.push((phase, apply_higher_tf_context(phase, clip_score(score), ctx)));
    };

    // 1. Capitulation: hard drop on a volume spike.
    if r5 <= params.drop_threshold && vol >= params.vol_spike {
        let mut sc = (r5.abs() * 5.0 + (vol - 1.0) * 0.2).min(1.0);
        if rsi_v < 30.0 {
            sc = clip_score(sc + 0.05);
        }
        push(Phase::Capitulation, sc, &mut candidates);
    }

    // 2. Recovery: fresh bounce against a still-negative medium return.
    if ret_5.is_some() && ret_20.is_some() && r5 > 0.01 && r20 < -0.02 {
        let strength =
            ((r5 - 0.01) / 0.02).min(1.0) * 0.5 + (r20.abs() / 0.05).min(1.0) * 0.3;
        let mut sc = clip_score(0.55 + strength);
        if rsi_v < 35.0 {
            sc = clip_score(sc + 0.08);
        }
        if bull_div {
            sc = clip_score(sc + 0.05);
        }
        push(Phase::Recovery, sc, &mut candidates);
    }

    // 3/4. Directional structure.
    if structure == Structure::Up && ret_20.map_or(true, |r| r >= -0.01) {
        let strength = ret_20.map_or(0.5, |r| (r + 0.01) / 0.04);
        let mut sc = clip_score(0.65 + 0.2 * strength.clamp(0.0, 1.0));
        if rsi_v > 70.0 {
            sc = clip_score(sc - 0.1);
        }
        if trend_str > 0.4 {
            sc = clip_score(sc + 0.03);
        } else if trend_str < 0.2 {
            sc = clip_score(sc - 0.03);
        }
        push(Phase::Markup, sc, &mut candidates);
    }
    if structure == Structure::Down && ret_20.map_or(true, |r| r <= 0.01) {
        let strength = ret_20.map_or(0.5, |r| (-r + 0.01) / 0.04);
        let mut sc = clip_score(0.65 + 0.2 * strength.clamp(0.0, 1.0));
        if rsi_v < 30.0 {
            sc = clip_score(sc + 0.05);
        }
        if bear_div {
            sc = clip_score(sc + 0.03);
        }
        if trend_str > 0.4 {
            sc = clip_score(sc + 0.03);
        } else if trend_str < 0.2 {
            sc = clip_score(sc - 0.03);
        }
        push(Phase::Markdown, sc, &mut candidates);
    }

    // 5. Range: position in the band decides, confirmations stack.
    if structure == Structure::Range {
        let before = candidates.len();
        if position.is_some() && pos <= params.range_position_low {
            let strength = 1.0 - pos / params.range_position_low.max(0.01);
            let mut sc = clip_score(0.5 + 0.25 * strength);
            if vol_low > 1.15 {
                sc = clip_score(sc + 0.05);
            }
            if buying > 1.15 {
                sc = clip_score(sc + 0.03);
            }
            if bull_div {
                sc = clip_score(sc + 0.04);
            }
            if spring {
                sc = clip_score(sc + 0.05);
            }
            if trend_str < 0.3 {
                sc = clip_score(sc + 0.03);
            }
            if fresh_low {
                sc = clip_score(sc + 0.02);
            }
            push(Phase::Accumulation, sc, &mut candidates);
        }
        if position.is_some() && pos >= params.range_position_high {
            let strength =
                ((pos - params.range_position_high) / (1.0 - params.range_position_high).max(0.01)).min(1.0);
            let mut sc = clip_score(0.5 + 0.25 * strength);
            if rsi_v > 70.0 {
                sc = clip_score(sc + 0.08);
            }
            if vol_high > 1.15 {
                sc = clip_score(sc + 0.05);
            }
            if selling > 1.15 {
                sc = clip_score(sc + 0.03);
            }
            if bear_div {
                sc = clip_score(sc + 0.04);
            }
            if upthrust {
                sc = clip_score(sc + 0.05);
            }
            if trend_str < 0.3 {
                sc = clip_score(sc + 0.03);
            }
            if fresh_high {
                sc = clip_score(sc + 0.02);
            }
            push(Phase::Distribution, sc, &mut candidates);
        }
        if r20 > 0.01 {
            let strength = ((r20 - 0.01) / 0.02).min(1.0);
            let mut sc = clip_score(0.4 + 0.2 * strength);
            if rsi_v > 70.0 {
                sc = clip_score(sc - 0.08);
            }
            push(Phase::Markup, sc, &mut candidates);
        }
        if r20 < -0.01 {
            let strength = ((r20.abs() - 0.01) / 0.02).min(1.0);
            let mut sc = clip_score(0.4 + 0.2 * strength);
            if rsi_v < 30.0 {
                sc = clip_score(sc + 0.05);
            }
            if bear_div {
                sc = clip_score(sc + 0.03);
            }
            push(Phase::Markdown, sc, &mut candidates);
        }
        if candidates.len() == before && candidates.is_empty() {
            push(Phase::Accumulation, 0.4, &mut candidates);
        }
    } else {
        // 6. Directional fallback when structure branches did not fire.
        if r20 > 0.02 {
            let strength = ((r20 - 0.02) / 0.05).min(1.0);
            let mut sc = clip_score(0.5 + 0.3 * strength);
            if rsi_v > 70.0 {
                sc = clip_score(sc - 0.1);
            }
            push(Phase::Markup, sc, &mut candidates);
        }
        if r20 < -0.02 {
            let strength = ((r20.abs() - 0.02) / 0.05).min(1.0);
            let mut sc = clip_score(0.5 + 0.3 * strength);
            if rsi_v < 30.0 {
                sc = clip_score(sc + 0.05);
            }
            if bear_div {
                sc = clip_score(sc + 0.03);
            }
            push(Phase::Markdown, sc, &mut candidates);
        }
    }

    if candidates.is_empty() {
        push(Phase::Accumulation, 0.3, &mut candidates);
    }

    PhaseResult::from_candidates(candidates, details, settings)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn candle(start_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new(start_time, open, high, low, close, volume)
    }

    /// Flat window with a crash over the last 5 bars and a 3x volume spike
    /// on the final bar.
    fn capitulation_window() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..45)
            .map(|i| candle(i, 100.0, 101.0, 99.0, 100.0, 10.0))
            .collect();
        let drops = [98.0, 96.0, 94.0, 92.0, 90.0];
        for (i, &close) in drops.iter().enumerate() {
            let open = if i == 0 { 100.0 } else { drops[i - 1] };
            let volume = if i == drops.len() - 1 { 60.0 } else { 10.0 };
            candles.push(candle(45 + i as i64, open, open, close - 0.5, close, volume));
        }
        candles
    }

    #[test]
    fn capitulation_on_crash_with_volume_spike() {
        let result = detect_phase_wyckoff(
            &capitulation_window(),
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(result.phase, Phase::Capitulation);
        assert!(result.score >= 0.5, "score {}", result.score);
    }

    #[test]
    fn score_always_in_unit_interval() {
        for window in [capitulation_window(), rising_window(), falling_window()] {
            let result = detect_phase_wyckoff(
                &window,
                Some(Timeframe::M15),
                &PhaseContext::default(),
                &PhaseSettings::default(),
            );
            assert!((0.0..=1.0).contains(&result.score));
            assert!((0.0..=1.0).contains(&result.secondary_score));
        }
    }

    fn rising_window() -> Vec<Candle> {
        (0..100)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.3;
                candle(i, base, base + 0.5, base - 0.5, base + 0.3, 10.0)
            })
            .collect()
    }

    fn falling_window() -> Vec<Candle> {
        (0..100)
            .map(|i| {
                let base = 200.0 - i as f64 * 0.3;
                candle(i, base, base + 0.5, base - 0.5, base - 0.3, 10.0)
            })
            .collect()
    }

    #[test]
    fn uptrend_is_markup_downtrend_is_markdown() {
        let up = detect_phase_wyckoff(
            &rising_window(),
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(up.phase, Phase::Markup);
        let down = detect_phase_wyckoff(
            &falling_window(),
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(down.phase, Phase::Markdown);
    }

    #[test]
    fn price_inversion_flips_directional_output() {
        let up = rising_window();
        let mean = up.iter().map(|c| c.close).sum::<f64>() / up.len() as f64;
        // Mirror every price around the window mean; high/low swap roles.
        let mirrored: Vec<Candle> = up
            .iter()
            .map(|c| {
                Candle::new(
                    c.start_time,
                    2.0 * mean - c.open,
                    2.0 * mean - c.low,
                    2.0 * mean - c.high,
                    2.0 * mean - c.close,
                    c.volume,
                )
            })
            .collect();
        let original = detect_phase_wyckoff(
            &up,
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        let flipped = detect_phase_wyckoff(
            &mirrored,
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert!(original.phase.is_bullish());
        assert!(flipped.phase.is_bearish());
    }

    #[test]
    fn higher_tf_context_nudges_score() {
        let window = rising_window();
        let neutral = detect_phase_wyckoff(
            &window,
            Some(Timeframe::H1),
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        let agreeing = detect_phase_wyckoff(
            &window,
            Some(Timeframe::H1),
            &PhaseContext {
                higher_tf_phase: Some(Phase::Markup),
                higher_tf_trend: Some(TrendDirection::Up),
            },
            &PhaseSettings::default(),
        );
        let disagreeing = detect_phase_wyckoff(
            &window,
            Some(Timeframe::H1),
            &PhaseContext {
                higher_tf_phase: Some(Phase::Markdown),
                higher_tf_trend: Some(TrendDirection::Down),
            },
            &PhaseSettings::default(),
        );
        assert!(agreeing.score >= neutral.score);
        assert!(disagreeing.score <= neutral.score);
        assert!(agreeing.score - disagreeing.score > 0.05);
    }

    #[test]
    fn short_window_is_unclear_accumulation() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0, 10.0)).collect();
        let result = detect_phase_wyckoff(
            &candles,
            None,
            &PhaseContext::default(),
            &PhaseSettings::default(),
        );
        assert_eq!(result.phase, Phase::Accumulation);
        assert!(result.unclear);
        assert_eq!(result.score, 0.0);
    }
}
