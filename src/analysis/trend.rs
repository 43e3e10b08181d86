// =============================================================================
// Trend, regime, and momentum detection
// =============================================================================
//
// Trend: independent evidence sources each add to a bullish or bearish
// score in [0, 1] — structure (0.20), EMA stack (0.18), ADX with DI
// direction (0.12 + strength-scaled part, or 0.06 in the weak band),
// short/medium returns (0.08 / 0.10), VWAP distance (0.10), OBV slope
// (0.08). Direction is the argmax when the winner clears the flat
// threshold; confidence is the winner's share of the total.
//
// Regime: {trend, range, surge} from ADX, the ATR ratio, and band width.
// Momentum: RSI midline + return_5 agreement.
// =============================================================================

use serde::Serialize;

use crate::indicators::{
    adx, atr, bb_width, bucket_structure, ema_stack, obv_slope, recent_return, round_to, rsi,
    trend_strength, volume_ratio, vwap_rolling, EmaTrend,
};
use crate::market_data::Candle;
use crate::types::{MomentumDirection, MomentumState, Regime, Structure, TrendDirection};

/// Winner must reach this before a direction is declared.
const FLAT_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct TrendSettings {
    pub strength_min: f64,
    pub unclear_threshold: f64,
    pub min_gap: f64,
    /// Stricter gap for down calls; 0 = use `min_gap`.
    pub min_gap_down: f64,
    /// Multiplier on both scores in a surge regime; 0 = off.
    pub surge_penalty: f64,
    pub low_volume_threshold: f64,
    /// Multiplier on both scores below the volume threshold; 0 = off.
    pub low_volume_penalty: f64,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            strength_min: 0.35,
            unclear_threshold: 0.3,
            min_gap: 0.08,
            min_gap_down: 0.0,
            surge_penalty: 0.0,
            low_volume_threshold: 0.7,
            low_volume_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrendDetails {
    pub structure: Option<Structure>,
    pub ema_trend: Option<EmaTrend>,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    pub adx: Option<f64>,
    pub plus_di: Option<f64>,
    pub minus_di: Option<f64>,
    pub trend_strength: Option<f64>,
    pub vwap_distance: Option<f64>,
    pub obv_slope: Option<f64>,
    pub return_5: Option<f64>,
    pub return_20: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrendResult {
    pub direction: TrendDirection,
    pub strength: f64,
    /// Winner's share of the combined evidence, 0..1.
    pub confidence: f64,
    pub unclear: bool,
    pub secondary_direction: Option<TrendDirection>,
    pub secondary_strength: f64,
    pub strength_gap: f64,
    pub bullish_score: f64,
    pub bearish_score: f64,
    pub details: TrendDetails,
}

impl TrendResult {
    pub fn insufficient() -> Self {
        Self {
            direction: TrendDirection::Flat,
            strength: 0.0,
            confidence: 0.0,
            unclear: true,
            secondary_direction: None,
            secondary_strength: 0.0,
            strength_gap: 0.0,
            bullish_score: 0.0,
            bearish_score: 0.0,
            details: TrendDetails::default(),
        }
    }
}

pub fn detect_trend(
    candles: &[Candle],
    lookback: usize,
    settings: &TrendSettings,
    regime: Option<Regime>,
) -> TrendResult {
    if candles.len() < 30 {
        return TrendResult::insufficient();
    }
    let mut lookback_eff = lookback.min(candles.len());
    if candles.len() >= 200 {
        lookback_eff = lookback.max(200).min(candles.len());
    }
    let c = &candles[candles.len() - lookback_eff..];

    let structure = bucket_structure(c, 5);
    let stack = ema_stack(c);
    let adx_reading = adx(c, 14);
    let ts = trend_strength(c, 14);
    let vwap = vwap_rolling(c, 50.min(c.len()));
    let obv = if c.len() >= 15 { obv_slope(c, 14) } else { None };
    let ret_5 = recent_return(c, 5);
    let ret_20 = recent_return(c, 20.min(c.len() - 1));
    let vol_ratio = volume_ratio(c, 3, 20);

    let details = TrendDetails {
        structure: Some(structure),
        ema_trend: stack.trend,
        ema20: stack.ema20.map(|v| round_to(v, 4)),
        ema50: stack.ema50.map(|v| round_to(v, 4)),
        ema200: stack.ema200.map(|v| round_to(v, 4)),
        adx: adx_reading.as_ref().map(|r| round_to(r.adx, 2)),
        plus_di: adx_reading.as_ref().map(|r| round_to(r.plus_di, 2)),
        minus_di: adx_reading.as_ref().map(|r| round_to(r.minus_di, 2)),
        trend_strength: ts.map(|v| round_to(v, 3)),
        vwap_distance: vwap.map(|(_, d)| round_to(d, 4)),
        obv_slope: obv.map(|v| round_to(v, 4)),
        return_5: ret_5.map(|v| round_to(v, 4)),
        return_20: ret_20.map(|v| round_to(v, 4)),
    };

    let mut bull = 0.0;
    let mut bear = 0.0;

    // Structure.
    match structure {
        Structure::Up => bull += 0.2,
        Structure::Down => bear += 0.2,
        Structure::Range => {}
    }

    // EMA stack.
    match stack.trend {
        Some(EmaTrend::Bullish) => bull += 0.18,
        Some(EmaTrend::Bearish) => bear += 0.18,
        _ => {}
    }

    // ADX strength, DI direction.
    if let Some(reading) = &adx_reading {
        if reading.adx >= 25.0 {
            let adx_contrib = ((reading.adx - 25.0) / 50.0).min(0.15);
            if reading.plus_di > reading.minus_di {
                bull += 0.12 + adx_contrib;
            } else {
                bear += 0.12 + adx_contrib;
            }
        } else if reading.adx >= 15.0 {
            if reading.plus_di > reading.minus_di {
                bull += 0.06;
            } else {
                bear += 0.06;
            }
        }
    }

    // Returns at two horizons.
    if let Some(r5) = ret_5 {
        if r5 > 0.005 {
            bull += 0.08 * (r5 / 0.02).min(1.0);
        } else if r5 < -0.005 {
            bear += 0.08 * (r5.abs() / 0.02).min(1.0);
        }
    }
    if let Some(r20) = ret_20 {
        if r20 > 0.01 {
            bull += 0.1 * (r20 / 0.05).min(1.0);
        } else if r20 < -0.01 {
            bear += 0.1 * (r20.abs() / 0.05).min(1.0);
        }
    }

    // VWAP distance.
    let vd = vwap.map_or(0.0, |(_, d)| d);
    if vd > 0.001 {
        bull += 0.1 * (vd / 0.02).min(1.0);
    } else if vd < -0.001 {
        bear += 0.1 * (vd.abs() / 0.02).min(1.0);
    }

    // OBV slope.
    let obv_v = obv.unwrap_or(0.0);
    if obv_v > 0.03 {
        bull += 0.08 * (obv_v / 0.1).min(1.0);
    } else if obv_v < -0.03 {
        bear += 0.08 * (obv_v.abs() / 0.1).min(1.0);
    }

    // Optional dampers.
    if settings.surge_penalty > 0.0 && regime == Some(Regime::Surge) {
        bull *= settings.surge_penalty;
        bear *= settings.surge_penalty;
    }
    if settings.low_volume_penalty > 0.0 {
        if let Some(vr) = vol_ratio {
            if vr < settings.low_volume_threshold {
                bull *= settings.low_volume_penalty;
                bear *= settings.low_volume_penalty;
            }
        }
    }

    let bull = bull.min(1.0);
    let bear = bear.min(1.0);

    let (direction, strength, secondary_strength) = if bull > bear && bull >= FLAT_THRESHOLD {
        (TrendDirection::Up, bull, bear)
    } else if bear > bull && bear >= FLAT_THRESHOLD {
        (TrendDirection::Down, bear, bull)
    } else {
        (TrendDirection::Flat, bull.max(bear), bull.min(bear))
    };

    let strength = round_to(strength, 4);
    let strength_gap = round_to((strength - secondary_strength).max(0.0), 4);
    let secondary_direction = match direction {
        TrendDirection::Up => Some(TrendDirection::Down),
        TrendDirection::Down => Some(TrendDirection::Up),
        TrendDirection::Flat => Some(if bull >= bear {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        }),
    };

    let total = bull + bear;
    let confidence = if total > 0.0 {
        (strength / total).clamp(0.0, 1.0)
    } else {
        0.5
    };

    let gap_required = if direction == TrendDirection::Down && settings.min_gap_down > 0.0 {
        settings.min_gap.max(settings.min_gap_down)
    } else {
        settings.min_gap
    };
    let unclear = strength < settings.unclear_threshold
        || strength < settings.strength_min
        || strength_gap < gap_required;

    TrendResult {
        direction,
        strength,
        confidence: round_to(confidence, 4),
        unclear,
        secondary_direction,
        secondary_strength: round_to(secondary_strength, 4),
        strength_gap,
        bullish_score: round_to(bull, 4),
        bearish_score: round_to(bear, 4),
        details,
    }
}

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegimeResult {
    pub regime: Regime,
    pub adx: Option<f64>,
    pub atr_ratio: Option<f64>,
    pub bb_width: Option<f64>,
}

impl RegimeResult {
    pub fn insufficient() -> Self {
        Self {
            regime: Regime::Range,
            adx: None,
            atr_ratio: None,
            bb_width: None,
        }
    }
}

/// Classify the regime over the last `lookback` candles.
///
/// surge: ATR doubled vs its earlier reading, or the bands blew out.
/// trend: ADX >= 25 without a surge. range: ADX < 20. The 20..25 band
/// resolves to trend at ADX >= 22.
pub fn detect_regime(candles: &[Candle], lookback: usize) -> RegimeResult {
    if candles.len() < 30 {
        return RegimeResult::insufficient();
    }
    let c = &candles[candles.len() - lookback.min(candles.len())..];
    let adx_reading = adx(c, 14);
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
    let width = bb_width(c, 20, 2.0);
    let adx_v = adx_reading.as_ref().map_or(0.0, |r| r.adx);

    let regime = if atr_ratio >= 2.0 || width.is_some_and(|w| w >= 0.15) {
        Regime::Surge
    } else if adx_v >= 25.0 && atr_ratio < 1.8 {
        Regime::Trend
    } else if adx_v < 20.0 {
        Regime::Range
    } else if adx_v >= 22.0 {
        Regime::Trend
    } else {
        Regime::Range
    };

    RegimeResult {
        regime,
        adx: adx_reading.map(|r| round_to(r.adx, 2)),
        atr_ratio: Some(round_to(atr_ratio, 3)),
        bb_width: width.map(|w| round_to(w, 4)),
    }
}

// ---------------------------------------------------------------------------
// Momentum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MomentumResult {
    pub direction: MomentumDirection,
    pub state: MomentumState,
    pub rsi: Option<f64>,
    pub return_5: Option<f64>,
}

impl MomentumResult {
    pub fn insufficient() -> Self {
        Self {
            direction: MomentumDirection::Neutral,
            state: MomentumState::Flat,
            rsi: None,
            return_5: None,
        }
    }
}

/// Momentum from the RSI midline and the 5-bar return: the RSI side picks
/// the direction; `return_5` grades it — strong when it pushes the same way
/// by >= 1%, fading when it has already turned against the RSI side.
pub fn detect_momentum(candles: &[Candle]) -> MomentumResult {
    if candles.len() < 20 {
        return MomentumResult::insufficient();
    }
    let rsi_val = rsi(candles, 14);
    let ret_5 = recent_return(candles, 5);
    let (Some(rsi_v), Some(r5)) = (rsi_val, ret_5) else {
        return MomentumResult::insufficient();
    };

    let direction = if rsi_v >= 55.0 {
        MomentumDirection::Bullish
    } else if rsi_v <= 45.0 {
        MomentumDirection::Bearish
    } else {
        MomentumDirection::Neutral
    };

    let state = match direction {
        MomentumDirection::Bullish => {
            if r5 >= 0.01 {
                MomentumState::Strong
            } else if r5 < 0.0 {
                MomentumState::Fading
            } else {
                MomentumState::Flat
            }
        }
        MomentumDirection::Bearish => {
            if r5 <= -0.01 {
                MomentumState::Strong
            } else if r5 > 0.0 {
                MomentumState::Fading
            } else {
                MomentumState::Flat
            }
        }
        MomentumDirection::Neutral => MomentumState::Flat,
    };

    MomentumResult {
        direction,
        state,
        rsi: Some(round_to(rsi_v, 1)),
        return_5: Some(round_to(r5, 4)),
    }
}
