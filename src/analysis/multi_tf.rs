// =============================================================================
// Multi-timeframe coordinator
// =============================================================================
//
// One call per control tick:
//   1. load per-TF candle tails (bounded parallelism),
//   2. quality-gate each tail,
//   3. independent per-TF pass (trend, phase without context, regime,
//      momentum) fanned out on a 4-worker pool,
//   4. contextual pass highest-TF first: lower-TF phases re-classified with
//      the higher TF's phase/trend injected,
//   5. stability FIFOs per TF (phase and trend),
//   6. zones + confluence + filter inputs from the highest TF,
//   7. aggregate filters, entry score, and the direction decision with a
//      reason that names every failing predicate.
//
// The stability histories are the only cross-tick state; they live in
// `CoordinatorState` behind a lock and are reset per backtest run.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::indicators::{atr, pivot_highs, pivot_lows, round_to, volume_ratio};
use crate::market_data::Candle;
use crate::store::CandleSource;
use crate::types::{Phase, Regime, SignalDirection, Timeframe, TrendDirection};

use super::phases::{detect_phase, PhaseContext, PhaseResult, PhaseSettings};
use super::quality::{validate_candles, QualityReport};
use super::trend::{
    detect_momentum, detect_regime, detect_trend, MomentumResult, RegimeResult, TrendResult,
    TrendSettings,
};
use super::zones::{detect_trading_zones, mark_confluence, ZoneReport, ZoneSettings};

/// Workers for the per-TF fan-out.
const MAX_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub phase: PhaseSettings,
    pub phase_stability_min: f64,
    pub history_size: usize,
    pub trend: TrendSettings,
    /// 0 disables the trend-stability gate entirely.
    pub trend_stability_min: f64,
    pub volume_min_ratio: f64,
    pub atr_max_ratio: f64,
    pub level_max_distance_pct: f64,
    pub tf_align_min: usize,
    pub candle_quality_min_score: f64,
    pub regime_block_surge: bool,
    pub entry_weight_phase: f64,
    pub entry_weight_trend: f64,
    pub entry_weight_tf_align: f64,
    pub signal_min_confidence: f64,
    pub zones: ZoneSettings,
    pub tail_limit: usize,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            phase: PhaseSettings {
                lookback: 100,
                min_score: cfg.phase_score_min,
                min_gap: cfg.phase_min_gap,
                method: cfg.phase_method,
            },
            phase_stability_min: cfg.phase_stability_min,
            history_size: cfg.phase_history_size.max(1),
            trend: TrendSettings {
                strength_min: cfg.trend_strength_min,
                unclear_threshold: cfg.trend_unclear_threshold,
                min_gap: cfg.trend_min_gap,
                min_gap_down: cfg.trend_min_gap_down,
                surge_penalty: cfg.trend_surge_penalty,
                low_volume_threshold: cfg.trend_low_volume_threshold,
                low_volume_penalty: cfg.trend_low_volume_penalty,
            },
            trend_stability_min: cfg.trend_stability_min,
            volume_min_ratio: cfg.volume_min_ratio,
            atr_max_ratio: cfg.atr_max_ratio,
            level_max_distance_pct: cfg.level_max_distance_pct,
            tf_align_min: cfg.tf_align_min,
            candle_quality_min_score: cfg.candle_quality_min_score,
            regime_block_surge: cfg.regime_block_surge,
            entry_weight_phase: cfg.entry_weight_phase,
            entry_weight_trend: cfg.entry_weight_trend,
            entry_weight_tf_align: cfg.entry_weight_tf_align,
            signal_min_confidence: cfg.signal_min_confidence,
            zones: ZoneSettings {
                max_levels: if cfg.trading_zones_max_levels == 0 {
                    None
                } else {
                    Some(cfg.trading_zones_max_levels)
                },
                ..ZoneSettings::default()
            },
            tail_limit: cfg.kline_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Stability histories
// ---------------------------------------------------------------------------

/// Cross-tick phase/trend FIFOs per timeframe. Reset before each backtest
/// so replays never inherit live-session history.
#[derive(Default)]
pub struct CoordinatorState {
    phase_history: Mutex<HashMap<Timeframe, Vec<Phase>>>,
    trend_history: Mutex<HashMap<Timeframe, Vec<TrendDirection>>>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.phase_history.lock().clear();
        self.trend_history.lock().clear();
    }

    /// Record the tick's phase and return `(stability, stable)`: the share
    /// of the FIFO holding the same phase, against the configured minimum.
    fn update_phase_stability(
        &self,
        tf: Timeframe,
        phase: Phase,
        history_size: usize,
        stability_min: f64,
    ) -> (f64, bool) {
        let mut histories = self.phase_history.lock();
        let history = histories.entry(tf).or_default();
        history.push(phase);
        if history.len() > history_size {
            history.remove(0);
        }
        let same = history.iter().filter(|p| **p == phase).count();
        let stability = same as f64 / history.len() as f64;
        (round_to(stability, 3), stability >= stability_min)
    }

    /// Trend FIFO; a zero minimum disables the gate and records nothing.
    fn update_trend_stability(
        &self,
        tf: Timeframe,
        trend: TrendDirection,
        history_size: usize,
        stability_min: f64,
    ) -> (f64, bool) {
        if stability_min <= 0.0 {
            return (0.0, true);
        }
        let mut histories = self.trend_history.lock();
        let history = histories.entry(tf).or_default();
        history.push(trend);
        if history.len() > history_size {
            history.remove(0);
        }
        let same = history.iter().filter(|t| **t == trend).count();
        let stability = same as f64 / history.len() as f64;
        (round_to(stability, 3), stability >= stability_min)
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeframeReport {
    pub tf: Timeframe,
    pub candles: Vec<Candle>,
    pub candle_quality_ok: bool,
    pub candle_quality_score: f64,
    pub candle_quality_issues: Vec<String>,
    pub regime: RegimeResult,
    pub trend: TrendResult,
    pub trend_stability: f64,
    pub trend_stable: bool,
    pub phase: PhaseResult,
    pub phase_stability: f64,
    pub phase_stable: bool,
    pub momentum: MomentumResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Strong,
    Medium,
    Weak,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryScoreBreakdown {
    pub phase: f64,
    pub trend: f64,
    pub tf_align_ratio: f64,
    pub stability_bonus: f64,
}

#[derive(Debug, Clone)]
pub struct Signals {
    pub direction: SignalDirection,
    pub reason: String,
    pub phase_ok: bool,
    pub phase_decision_ready: bool,
    pub entry_score: f64,
    pub entry_score_breakdown: EntryScoreBreakdown,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub above_min_confidence: bool,
}

#[derive(Debug, Clone)]
pub struct MultiTfReport {
    pub symbol: String,
    /// Ascending by duration; the last entry is the decision timeframe.
    pub timeframes: Vec<TimeframeReport>,
    pub higher_tf: Timeframe,
    pub higher_tf_trend: TrendDirection,
    pub higher_tf_trend_strength: f64,
    pub higher_tf_trend_confidence: f64,
    pub higher_tf_trend_unclear: bool,
    pub higher_tf_phase: Phase,
    pub higher_tf_phase_score: f64,
    pub higher_tf_phase_unclear: bool,
    pub higher_tf_phase_stable: bool,
    pub higher_tf_score_gap: f64,
    pub higher_tf_secondary_phase: Option<Phase>,
    pub higher_tf_regime: Regime,
    pub volume_ratio: Option<f64>,
    pub volume_ok: bool,
    pub atr_ratio: Option<f64>,
    pub atr_ok: bool,
    pub level_ok: bool,
    pub filters_ok: bool,
    pub regime_ok: bool,
    pub candle_quality_ok: bool,
    pub tf_align_count: usize,
    pub tf_align_ok: bool,
    pub trading_zones: ZoneReport,
    pub swing_low: Option<f64>,
    pub swing_high: Option<f64>,
    pub distance_to_support_pct: Option<f64>,
    pub distance_to_resistance_pct: Option<f64>,
    pub signals: Signals,
    pub market_state_narrative: String,
}

// ---------------------------------------------------------------------------
// Swing levels
// ---------------------------------------------------------------------------

/// Raw swing-pivot support/resistance on the decision timeframe: the level
/// fallback when the zone model has nothing to say (too few bars for
/// clustering). Nearest pivot low below the close and pivot high above it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwingLevels {
    pub swing_low: Option<f64>,
    pub swing_high: Option<f64>,
    pub distance_to_support_pct: Option<f64>,
    pub distance_to_resistance_pct: Option<f64>,
}

fn swing_levels(candles: &[Candle], left: usize, right: usize) -> SwingLevels {
    let Some(last) = candles.last() else {
        return SwingLevels::default();
    };
    let close = last.close;
    if close <= 0.0 {
        return SwingLevels::default();
    }
    let swing_low = pivot_lows(candles, left, right)
        .into_iter()
        .map(|(price, _)| price)
        .filter(|p| *p < close)
        .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p))));
    let swing_high = pivot_highs(candles, left, right)
        .into_iter()
        .map(|(price, _)| price)
        .filter(|p| *p > close)
        .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.min(p))));
    SwingLevels {
        swing_low,
        swing_high,
        distance_to_support_pct: swing_low.map(|p| round_to((close - p) / close, 4)),
        distance_to_resistance_pct: swing_high.map(|p| round_to((p - close) / close, 4)),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Pull candle tails for every timeframe from the source. IO is bounded by
/// the source itself (a single sqlite connection serializes anyway); the
/// expensive part — analysis — is what fans out in `analyze_from_data`.
pub fn load_tails<S: CandleSource>(
    source: &S,
    symbol: &str,
    timeframes: &[Timeframe],
    limit: usize,
) -> Result<HashMap<Timeframe, Vec<Candle>>> {
    let mut data = HashMap::with_capacity(timeframes.len());
    for &tf in timeframes {
        let candles = source
            .candles_tail(symbol, tf, limit)
            .with_context(|| format!("failed to load {symbol} {tf} tail"))?;
        data.insert(tf, candles);
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Core computation
// ---------------------------------------------------------------------------

struct IndependentPass {
    tf: Timeframe,
    candles: Vec<Candle>,
    quality: QualityReport,
    regime: RegimeResult,
    trend: TrendResult,
    phase: PhaseResult,
    momentum: MomentumResult,
}

fn analyze_single_timeframe(
    tf: Timeframe,
    raw: Vec<Candle>,
    settings: &CoordinatorSettings,
) -> IndependentPass {
    let quality = if raw.is_empty() {
        QualityReport::empty()
    } else {
        validate_candles(&raw, Some(tf), true)
    };
    let candles = if quality.filtered.is_empty() {
        raw
    } else {
        quality.filtered.clone()
    };

    let regime = detect_regime(&candles, 50);
    let trend = detect_trend(&candles, 100, &settings.trend, Some(regime.regime));
    let phase = detect_phase(&candles, Some(tf), &PhaseContext::default(), &settings.phase);
    let momentum = detect_momentum(&candles);

    IndependentPass {
        tf,
        candles,
        quality,
        regime,
        trend,
        phase,
        momentum,
    }
}

/// Multi-TF analysis over already-loaded data (live tick or backtest step).
pub fn analyze_from_data(
    symbol: &str,
    mut data: HashMap<Timeframe, Vec<Candle>>,
    state: &CoordinatorState,
    settings: &CoordinatorSettings,
) -> Result<MultiTfReport> {
    let mut sorted_tfs: Vec<Timeframe> = data.keys().copied().collect();
    sorted_tfs.sort();
    anyhow::ensure!(!sorted_tfs.is_empty(), "no timeframes to analyze");
    let higher_tf = *sorted_tfs.last().expect("non-empty");

    // Independent pass, fanned out on a bounded pool.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(MAX_WORKERS.min(sorted_tfs.len().max(1)))
        .build()
        .context("failed to build analysis pool")?;
    let jobs: Vec<(Timeframe, Vec<Candle>)> = sorted_tfs
        .iter()
        .map(|&tf| (tf, data.remove(&tf).unwrap_or_default()))
        .collect();
    let mut passes: Vec<IndependentPass> = pool.install(|| {
        jobs.into_par_iter()
            .map(|(tf, candles)| analyze_single_timeframe(tf, candles, settings))
            .collect()
    });
    passes.sort_by_key(|p| p.tf);

    // Contextual pass: re-classify lower-TF phases with the higher TF's
    // independent phase/trend injected.
    let (h_phase, h_trend) = {
        let higher_pass = passes.last().expect("non-empty");
        (higher_pass.phase.phase, higher_pass.trend.direction)
    };
    let higher_ctx = PhaseContext {
        higher_tf_phase: Some(h_phase),
        higher_tf_trend: Some(h_trend),
    };
    for pass in passes.iter_mut() {
        if pass.tf == higher_tf || pass.candles.len() < 30 {
            continue;
        }
        pass.phase = detect_phase(&pass.candles, Some(pass.tf), &higher_ctx, &settings.phase);
    }

    // Stability FIFOs record the final (contextual) classifications.
    let mut reports: Vec<TimeframeReport> = Vec::with_capacity(passes.len());
    for pass in passes {
        let (phase_stability, phase_stable) = state.update_phase_stability(
            pass.tf,
            pass.phase.phase,
            settings.history_size,
            settings.phase_stability_min,
        );
        let (trend_stability, trend_stable) = state.update_trend_stability(
            pass.tf,
            pass.trend.direction,
            settings.history_size,
            settings.trend_stability_min,
        );
        let candle_quality_ok = settings.candle_quality_min_score <= 0.0
            || (pass.quality.quality_score >= settings.candle_quality_min_score
                && pass.quality.valid);
        reports.push(TimeframeReport {
            tf: pass.tf,
            candles: pass.candles,
            candle_quality_ok,
            candle_quality_score: pass.quality.quality_score,
            candle_quality_issues: pass.quality.issues.iter().take(5).cloned().collect(),
            regime: pass.regime,
            trend: pass.trend,
            trend_stability,
            trend_stable,
            phase: pass.phase,
            phase_stability,
            phase_stable,
            momentum: pass.momentum,
        });
    }

    let higher = reports.last().expect("non-empty");
    let higher_candles = &higher.candles;
    let higher_tf_trend = higher.trend.direction;
    let higher_tf_phase = higher.phase.phase;

    // Filters from the highest TF.
    let vol_ratio = if higher_candles.len() >= 20 {
        volume_ratio(higher_candles, 5, 20)
    } else {
        None
    };
    let atr_now = atr(higher_candles, 14);
    let atr_prev = if higher_candles.len() >= 19 {
        atr(&higher_candles[..higher_candles.len() - 5], 14)
    } else {
        atr_now
    };
    let atr_ratio = match (atr_now, atr_prev) {
        (Some(now), Some(prev)) if prev > 0.0 => Some(now / prev),
        _ => None,
    };
    let volume_ok = settings.volume_min_ratio <= 0.0
        || vol_ratio.is_some_and(|v| v >= settings.volume_min_ratio);
    let atr_ok =
        settings.atr_max_ratio <= 0.0 || atr_ratio.is_some_and(|v| v <= settings.atr_max_ratio);

    // Zones + cross-TF confluence from the highest TF.
    let mut trading_zones = if higher_candles.len() >= 15 {
        detect_trading_zones(higher_candles, &settings.zones)
    } else {
        ZoneReport::default()
    };
    if !trading_zones.levels.is_empty() && reports.len() > 1 {
        let others: Vec<(Timeframe, Vec<Candle>)> = reports
            .iter()
            .filter(|r| r.tf != higher_tf)
            .map(|r| (r.tf, r.candles.clone()))
            .collect();
        mark_confluence(&mut trading_zones, higher_tf, &others, &settings.zones);
    }

    // Level distances: zones have priority; raw swing pivots are the
    // fallback when the zone model produced no levels.
    let swings = if higher_candles.len() >= 10 {
        swing_levels(higher_candles, 3, 3)
    } else {
        SwingLevels::default()
    };
    let (distance_to_support_pct, distance_to_resistance_pct) = if trading_zones.levels.is_empty()
    {
        (
            swings.distance_to_support_pct,
            swings.distance_to_resistance_pct,
        )
    } else {
        (
            trading_zones.distance_to_support_pct,
            trading_zones.distance_to_resistance_pct,
        )
    };
    let level_ok = settings.level_max_distance_pct <= 0.0
        || distance_to_support_pct
            .is_some_and(|d| (0.0..=settings.level_max_distance_pct).contains(&d))
        || distance_to_resistance_pct
            .is_some_and(|d| (0.0..=settings.level_max_distance_pct).contains(&d));
    let filters_ok = volume_ok && atr_ok && level_ok;

    let higher_tf_regime = higher.regime.regime;
    let regime_ok = higher_tf_regime != Regime::Surge || !settings.regime_block_surge;

    let candle_quality_ok = settings.candle_quality_min_score <= 0.0
        || reports.iter().all(|r| r.candle_quality_ok);

    // TF alignment: trend matches the highest TF and the phase backs the
    // direction (any phase counts when the higher trend is flat).
    let tf_align_count = reports
        .iter()
        .filter(|r| {
            r.trend.direction == higher_tf_trend
                && match higher_tf_trend {
                    TrendDirection::Up => r.phase.phase.is_bullish(),
                    TrendDirection::Down => r.phase.phase.is_bearish(),
                    TrendDirection::Flat => true,
                }
        })
        .count();
    let tf_align_ok = tf_align_count >= settings.tf_align_min;

    let trend_stable_ok = settings.trend_stability_min <= 0.0 || higher.trend_stable;
    let phase_ok = higher.phase.score >= settings.phase.min_score;
    let phase_decision_ready = phase_ok
        && !higher.phase.unclear
        && higher.phase_stable
        && higher.phase.score_gap >= settings.phase.min_gap
        && !higher.trend.unclear
        && filters_ok
        && tf_align_ok
        && trend_stable_ok
        && regime_ok
        && candle_quality_ok;

    // Direction decision + aggregated reason.
    let mut direction = SignalDirection::None;
    let mut reason;
    if !phase_ok {
        reason = format!(
            "phase {higher_tf_phase} (score={:.2} < {:.2}) — not usable for entry",
            higher.phase.score, settings.phase.min_score
        );
    } else if !phase_decision_ready {
        let mut why: Vec<String> = Vec::new();
        if higher.phase.unclear {
            why.push("phase unclear".into());
        }
        if !higher.phase_stable {
            why.push("phase unstable".into());
        }
        if higher.phase.score_gap < settings.phase.min_gap {
            why.push(format!(
                "score gap {:.2} < {:.2}",
                higher.phase.score_gap, settings.phase.min_gap
            ));
        }
        if higher.trend.unclear {
            why.push("trend unclear".into());
        }
        if !volume_ok {
            why.push("volume low".into());
        }
        if !atr_ok {
            why.push("ATR high".into());
        }
        if !level_ok {
            why.push("price far from levels".into());
        }
        if !tf_align_ok {
            why.push(format!(
                "tf alignment {tf_align_count} < {}",
                settings.tf_align_min
            ));
        }
        if !trend_stable_ok {
            why.push("trend unstable".into());
        }
        if !regime_ok {
            why.push("surge regime".into());
        }
        if !candle_quality_ok {
            why.push("candle quality".into());
        }
        reason = format!("phase {higher_tf_phase} — not ready to decide: {}", why.join(", "));
    } else {
        reason = format!("higher TF {higher_tf}: {higher_tf_trend}, phase {higher_tf_phase}");
        match higher_tf_trend {
            TrendDirection::Up => {
                if higher_tf_phase.is_bullish() {
                    direction = SignalDirection::Long;
                    reason = format!(
                        "trend up on {higher_tf}, phase {higher_tf_phase} — long allowed"
                    );
                } else {
                    reason = format!(
                        "trend up but phase {higher_tf_phase} is not bullish — careful with longs"
                    );
                }
            }
            TrendDirection::Down => {
                if higher_tf_phase.is_bearish() {
                    direction = SignalDirection::Short;
                    reason = format!(
                        "trend down on {higher_tf}, phase {higher_tf_phase} — short allowed"
                    );
                } else {
                    reason = format!(
                        "trend down but phase {higher_tf_phase} is not bearish — careful with shorts"
                    );
                }
            }
            TrendDirection::Flat => {}
        }
    }

    // Entry score: weighted mean + a small stability bonus.
    let weight_sum =
        (settings.entry_weight_phase + settings.entry_weight_trend + settings.entry_weight_tf_align)
            .max(f64::MIN_POSITIVE);
    let tf_align_ratio = tf_align_count as f64 / reports.len().max(1) as f64;
    let stability_bonus = if higher.phase_stable && higher.trend_stable {
        0.05
    } else {
        0.0
    };
    let entry_score_raw = (settings.entry_weight_phase * higher.phase.score
        + settings.entry_weight_trend * higher.trend.strength
        + settings.entry_weight_tf_align * tf_align_ratio)
        / weight_sum;
    let entry_score = round_to((entry_score_raw + stability_bonus).clamp(0.0, 1.0), 3);

    let confidence = if direction != SignalDirection::None {
        entry_score
    } else {
        0.0
    };
    let confidence_level = if confidence >= 0.7 {
        ConfidenceLevel::Strong
    } else if confidence >= 0.5 {
        ConfidenceLevel::Medium
    } else if confidence > 0.0 {
        ConfidenceLevel::Weak
    } else {
        ConfidenceLevel::None
    };

    let zone_str = if trading_zones.at_support_zone {
        "at support"
    } else if trading_zones.at_resistance_zone {
        "at resistance"
    } else if trading_zones.in_zone {
        "inside the S-R zone"
    } else {
        "away from key zones"
    };
    let market_state_narrative = format!(
        "Now: higher TF trend {higher_tf_trend}, phase {higher_tf_phase}, regime {higher_tf_regime}; \
         price {zone_str}; TF alignment {tf_align_count}/{}.",
        reports.len()
    );

    debug!(
        symbol,
        higher_tf = %higher_tf,
        direction = %direction,
        entry_score,
        "multi-TF analysis complete"
    );

    let signals = Signals {
        direction,
        reason,
        phase_ok,
        phase_decision_ready,
        entry_score,
        entry_score_breakdown: EntryScoreBreakdown {
            phase: higher.phase.score,
            trend: higher.trend.strength,
            tf_align_ratio: round_to(tf_align_ratio, 3),
            stability_bonus,
        },
        confidence: round_to(confidence, 3),
        confidence_level,
        above_min_confidence: confidence >= settings.signal_min_confidence,
    };

    Ok(MultiTfReport {
        symbol: symbol.to_string(),
        higher_tf,
        higher_tf_trend,
        higher_tf_trend_strength: higher.trend.strength,
        higher_tf_trend_confidence: higher.trend.confidence,
        higher_tf_trend_unclear: higher.trend.unclear,
        higher_tf_phase,
        higher_tf_phase_score: higher.phase.score,
        higher_tf_phase_unclear: higher.phase.unclear,
        higher_tf_phase_stable: higher.phase_stable,
        higher_tf_score_gap: higher.phase.score_gap,
        higher_tf_secondary_phase: higher.phase.secondary_phase,
        higher_tf_regime,
        volume_ratio: vol_ratio.map(|v| round_to(v, 3)),
        volume_ok,
        atr_ratio: atr_ratio.map(|v| round_to(v, 3)),
        atr_ok,
        level_ok,
        filters_ok,
        regime_ok,
        candle_quality_ok,
        tf_align_count,
        tf_align_ok,
        trading_zones,
        swing_low: swings.swing_low,
        swing_high: swings.swing_high,
        distance_to_support_pct,
        distance_to_resistance_pct,
        signals,
        market_state_narrative,
        timeframes: reports,
    })
}

/// Load-and-analyze convenience used by the live control loop.
pub fn analyze_multi_timeframe<S: CandleSource>(
    source: &S,
    symbol: &str,
    timeframes: &[Timeframe],
    state: &CoordinatorState,
    settings: &CoordinatorSettings,
) -> Result<MultiTfReport> {
    let data = load_tails(source, symbol, timeframes, settings.tail_limit)?;
    analyze_from_data(symbol, data, state, settings)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending_candles(n: usize, step: f64, tf: Timeframe) -> Vec<Candle> {
        let dur = tf.duration_ms().unwrap_or(60_000);
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * step;
                Candle::new(
                    i as i64 * dur,
                    base,
                    base + 0.6,
                    base - 0.6,
                    base + step.signum() * 0.4,
                    10.0,
                )
            })
            .collect()
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            phase: PhaseSettings::default(),
            phase_stability_min: 0.6,
            history_size: 5,
            trend: TrendSettings::default(),
            trend_stability_min: 0.0,
            volume_min_ratio: 0.0,
            atr_max_ratio: 0.0,
            level_max_distance_pct: 0.0,
            tf_align_min: 1,
            candle_quality_min_score: 0.0,
            regime_block_surge: true,
            entry_weight_phase: 0.4,
            entry_weight_trend: 0.35,
            entry_weight_tf_align: 0.25,
            signal_min_confidence: 0.0,
            zones: ZoneSettings::default(),
            tail_limit: 200,
        }
    }

    fn uptrend_data() -> HashMap<Timeframe, Vec<Candle>> {
        let mut data = HashMap::new();
        data.insert(Timeframe::M15, trending_candles(200, 0.25, Timeframe::M15));
        data.insert(Timeframe::H1, trending_candles(200, 0.25, Timeframe::H1));
        data.insert(Timeframe::H4, trending_candles(200, 0.25, Timeframe::H4));
        data.insert(Timeframe::D1, trending_candles(200, 0.25, Timeframe::D1));
        data
    }

    #[test]
    fn aligned_uptrend_emits_long_once_stable() {
        let state = CoordinatorState::new();
        let cfg = settings();
        // Warm the stability FIFOs: the first ticks may be unstable.
        let mut last = None;
        for _ in 0..5 {
            last = Some(analyze_from_data("BTCUSDT", uptrend_data(), &state, &cfg).unwrap());
        }
        let report = last.unwrap();
        assert_eq!(report.higher_tf, Timeframe::D1);
        assert_eq!(report.higher_tf_trend, TrendDirection::Up);
        assert!(report.signals.phase_decision_ready, "reason: {}", report.signals.reason);
        assert_eq!(report.signals.direction, SignalDirection::Long);
        assert!(report.signals.entry_score > 0.0);
        assert!(report.tf_align_count >= 1);
    }

    #[test]
    fn reason_lists_failing_predicates() {
        let state = CoordinatorState::new();
        let mut cfg = settings();
        cfg.tf_align_min = 99; // impossible alignment requirement
        let report = analyze_from_data("BTCUSDT", uptrend_data(), &state, &cfg).unwrap();
        assert_eq!(report.signals.direction, SignalDirection::None);
        assert!(
            report.signals.reason.contains("tf alignment"),
            "reason was: {}",
            report.signals.reason
        );
    }

    #[test]
    fn swing_levels_back_up_the_zone_model_on_short_tails() {
        let state = CoordinatorState::new();
        let mut cfg = settings();
        cfg.level_max_distance_pct = 0.15;

        // Decision TF has only 12 bars: the zone model stays empty (needs
        // 15), so level distances must come from the raw swing pivots —
        // a spike high at 110 and a trough low at 90 around a 100 close.
        let mut data = HashMap::new();
        data.insert(Timeframe::M15, trending_candles(200, 0.25, Timeframe::M15));
        data.insert(Timeframe::H1, trending_candles(200, 0.25, Timeframe::H1));
        let bars = [
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 103.0, 99.0, 102.0),
            (102.0, 110.0, 101.0, 105.0),
            (105.0, 106.0, 100.0, 101.0),
            (101.0, 102.0, 95.0, 97.0),
            (97.0, 98.0, 90.0, 95.0),
            (95.0, 99.0, 94.0, 98.0),
            (98.0, 100.0, 97.0, 99.0),
            (99.0, 101.0, 98.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
        ];
        let dur = Timeframe::D1.duration_ms().unwrap();
        let d1: Vec<Candle> = bars
            .iter()
            .enumerate()
            .map(|(i, &(o, h, l, c))| Candle::new(i as i64 * dur, o, h, l, c, 10.0))
            .collect();
        data.insert(Timeframe::D1, d1);

        let report = analyze_from_data("BTCUSDT", data, &state, &cfg).unwrap();
        assert!(report.trading_zones.levels.is_empty());
        assert_eq!(report.swing_low, Some(90.0));
        assert_eq!(report.swing_high, Some(110.0));
        assert_eq!(report.distance_to_support_pct, Some(0.1));
        assert_eq!(report.distance_to_resistance_pct, Some(0.1));
        assert!(report.level_ok);
    }

    #[test]
    fn zone_distances_take_priority_over_swings() {
        let state = CoordinatorState::new();
        let cfg = settings();
        let mut last = None;
        for _ in 0..2 {
            last = Some(analyze_from_data("BTCUSDT", uptrend_data(), &state, &cfg).unwrap());
        }
        let report = last.unwrap();
        // A full 200-bar decision tail produces zone levels; the reported
        // distances must be the zone model's, not the raw pivots'.
        assert!(!report.trading_zones.levels.is_empty());
        assert_eq!(
            report.distance_to_support_pct,
            report.trading_zones.distance_to_support_pct
        );
        assert_eq!(
            report.distance_to_resistance_pct,
            report.trading_zones.distance_to_resistance_pct
        );
    }

    #[test]
    fn stability_requires_repeated_phases() {
        let state = CoordinatorState::new();
        let cfg = settings();
        let first = analyze_from_data("BTCUSDT", uptrend_data(), &state, &cfg).unwrap();
        // One observation fills the FIFO with a single entry: trivially 1.0.
        assert!(first.higher_tf_phase_stable);

        // A sudden regime flip resets the ratio below the minimum.
        let mut flipped = uptrend_data();
        flipped.insert(Timeframe::D1, trending_candles(200, -0.25, Timeframe::D1));
        let second = analyze_from_data("BTCUSDT", flipped, &state, &cfg).unwrap();
        assert!(!second.higher_tf_phase_stable);
    }

    #[test]
    fn reset_clears_histories() {
        let state = CoordinatorState::new();
        let cfg = settings();
        let _ = analyze_from_data("BTCUSDT", uptrend_data(), &state, &cfg).unwrap();
        state.reset();
        assert!(state.phase_history.lock().is_empty());
        assert!(state.trend_history.lock().is_empty());
    }

    #[test]
    fn surge_regime_blocks_entry_when_configured() {
        let state = CoordinatorState::new();
        let cfg = settings();
        // Calm trend, then a volatility explosion on the decision TF.
        let mut data = uptrend_data();
        let mut wild = trending_candles(190, 0.25, Timeframe::D1);
        let dur = Timeframe::D1.duration_ms().unwrap();
        let last_close = wild.last().unwrap().close;
        for i in 0..10 {
            let c = last_close + i as f64 * 5.0;
            wild.push(Candle::new(
                (190 + i) as i64 * dur,
                c,
                c + 30.0,
                c - 30.0,
                c + 15.0,
                10.0,
            ));
        }
        data.insert(Timeframe::D1, wild);
        let report = analyze_from_data("BTCUSDT", data, &state, &cfg).unwrap();
        assert_eq!(report.higher_tf_regime, Regime::Surge);
        assert!(!report.regime_ok);
        assert_eq!(report.signals.direction, SignalDirection::None);
    }

    #[test]
    fn empty_input_is_an_error() {
        let state = CoordinatorState::new();
        let cfg = settings();
        assert!(analyze_from_data("BTCUSDT", HashMap::new(), &state, &cfg).is_err());
    }
}
