// =============================================================================
// Indicators-only phase classifier
// =============================================================================
//
// EMA 20/50/200 stack, ADX(14), Bollinger width, RSI(14), OBV slope, and
// rolling VWAP. No Wyckoff structure, no volume-at-bounds reading. Shares
// the classifier signature so it can be swapped in via PHASE_METHOD.
// =============================================================================

use crate::indicators::{
    adx, bb_width, clip_score, ema_stack, obv_slope, price_position_in_range, recent_return,
    round_to, rsi, volume_ratio, vwap_rolling, EmaTrend,
};
use crate::market_data::Candle;
use crate::types::{Phase, Timeframe};

use super::phases::{
    apply_higher_tf_context, PhaseContext, PhaseDetails, PhaseParams, PhaseResult, PhaseSettings,
};

pub fn detect_phase(
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
    let lb = 50.min(c.len());

    let stack = ema_stack(c);
    let adx_reading = adx(c, 14);
    let width = bb_width(c, 20, 2.0);
    let rsi_val = rsi(c, 14);
    let obv = obv_slope(c, 14);
    let vwap = vwap_rolling(c, lb);
    let position = price_position_in_range(c, lb);
    let vol_ratio = volume_ratio(c, 3, 20);
    let ret_5 = recent_return(c, 5);
    let ret_20 = recent_return(c, 20.min(c.len() - 1));

    let adx_v = adx_reading.as_ref().map_or(0.0, |r| r.adx);
    let plus_di = adx_reading.as_ref().map(|r| r.plus_di);
    let minus_di = adx_reading.as_ref().map(|r| r.minus_di);
    let bb_w = width.unwrap_or(0.05);
    let rsi_v = rsi_val.unwrap_or(50.0);
    let obv_v = obv.unwrap_or(0.0);
    let vwap_dist = vwap.map_or(0.0, |(_, d)| d);
    let pos = position.unwrap_or(0.5);
    let vol = vol_ratio.unwrap_or(1.0);
    let r5 = ret_5.unwrap_or(0.0);
    let r20 = ret_20.unwrap_or(0.0);

    let details = PhaseDetails {
        position_in_range: position.map(|v| round_to(v, 3)),
        volume_ratio: vol_ratio.map(|v| round_to(v, 3)),
        return_5: ret_5.map(|v| round_to(v, 4)),
        return_20: ret_20.map(|v| round_to(v, 4)),
        rsi: rsi_val.map(|v| round_to(v, 1)),
        ..PhaseDetails::default()
    };

    let mut candidates: Vec<(Phase, f64)> = Vec::new();
    let push = |phase: Phase, score: f64, candidates: &mut Vec<(Phase, f64)>| {
        candidates.push((phase, apply_higher_tf_context(phase, clip_score(score), ctx)));
    };

    // Capitulation: crash + volume spike + oversold RSI.
    if r5 <= params.drop_threshold && vol >= params.vol_spike && rsi_v < 30.0 {
        let sc = (r5.abs() * 4.0 + (vol - 1.0) * 0.15).min(1.0);
        push(Phase::Capitulation, sc, &mut candidates);
    }

    // Recovery: bounce with the medium return still negative.
    if ret_5.is_some() && ret_20.is_some() && r5 > 0.008 && r20 < -0.015 {
        let mut sc = 0.5 + 0.2 * (r5 / 0.02).min(1.0) + 0.2 * (r20.abs() / 0.04).min(1.0);
        if rsi_v < 40.0 {
            sc += 0.05;
        }
        if vwap_dist > 0.0 || obv_v > 0.03 {
            sc += 0.05;
        }
        push(Phase::Recovery, sc, &mut candidates);
    }

    // Markup: bullish stack in a trending market.
    if stack.trend == Some(EmaTrend::Bullish) && adx_v > 22.0 {
        let mut sc = 0.55 + 0.15 * ((adx_v - 22.0) / 30.0).min(1.0);
        if let (Some(p), Some(m)) = (plus_di, minus_di) {
            if p > m {
                sc += 0.08;
            }
        }
        if vwap_dist > 0.0 {
            sc += 0.05;
        }
        if obv_v > 0.03 {
            sc += 0.05;
        }
        if (40.0..=65.0).contains(&rsi_v) {
            sc += 0.05;
        } else if rsi_v > 70.0 {
            sc -= 0.1;
        }
        push(Phase::Markup, sc, &mut candidates);
    }

    // Markdown: bearish stack in a trending market.
    if stack.trend == Some(EmaTrend::Bearish) && adx_v > 22.0 {
        let mut sc = 0.55 + 0.15 * ((adx_v - 22.0) / 30.0).min(1.0);
        if let (Some(p), Some(m)) = (plus_di, minus_di) {
            if m > p {
                sc += 0.08;
            }
        }
        if vwap_dist < 0.0 {
            sc += 0.05;
        }
        if obv_v < -0.03 {
            sc += 0.05;
        }
        if (35.0..=60.0).contains(&rsi_v) {
            sc += 0.03;
        } else if rsi_v < 25.0 {
            sc += 0.05;
        }
        push(Phase::Markdown, sc, &mut candidates);
    }

    // Accumulation / distribution: compression at a range bound.
    if adx_v < 20.0 && bb_w < 0.06 && pos <= params.range_position_low {
        let mut sc = 0.45 + 0.25 * (1.0 - pos / params.range_position_low.max(0.01));
        if rsi_v < 45.0 {
            sc += 0.05;
        }
        if bb_w < 0.04 {
            sc += 0.05;
        }
        push(Phase::Accumulation, sc, &mut candidates);
    }
    if adx_v < 20.0 && bb_w < 0.06 && pos >= params.range_position_high {
        let mut sc = 0.45
            + 0.25 * (pos - params.range_position_high)
                / (1.0 - params.range_position_high).max(0.01);
        if rsi_v > 55.0 {
            sc += 0.05;
        }
        if bb_w < 0.04 {
            sc += 0.05;
        }
        push(Phase::Distribution, sc, &mut candidates);
    }

    // Fallback by indicator direction, then by range position.
    if candidates.is_empty() {
        if stack.trend == Some(EmaTrend::Bullish) || (vwap_dist > 0.0 && obv_v > 0.0) {
            let sc = 0.45
                + 0.15 * f64::from(stack.trend == Some(EmaTrend::Bullish))
                + 0.1 * f64::from(vwap_dist > 0.0);
            push(Phase::Markup, sc, &mut candidates);
        } else if stack.trend == Some(EmaTrend::Bearish) || (vwap_dist < 0.0 && obv_v < 0.0) {
            let sc = 0.45
                + 0.15 * f64::from(stack.trend == Some(EmaTrend::Bearish))
                + 0.1 * f64::from(vwap_dist < 0.0);
            push(Phase::Markdown, sc, &mut candidates);
        } else if pos <= 0.5 {
            push(Phase::Accumulation, 0.35 + 0.2 * (1.0 - pos), &mut candidates);
        } else {
            push(Phase::Distribution, 0.35 + 0.2 * pos, &mut candidates);
        }
    }

    PhaseResult::from_candidates(candidates, details, settings)
}
