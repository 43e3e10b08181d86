// =============================================================================
// Trading zones — clustered pivot levels with role switching
// =============================================================================
//
// A level born as resistance (swing high) becomes support after a confirmed
// break above it, and vice versa. Pipeline: pivot extraction → like-kind
// price clustering → enrichment (volume at the level, ±ATR zone width,
// round-number bonus, recency decay) → composite strength → trim → role
// confirmation → nearest levels / recent flips / cross-TF confluence.
//
// Break confirmation walks each level's candles forward from the bar after
// the cluster's last member and flips the role at the first breaching close
// whose volume clears `volume_confirm_ratio * MA20(volume)`. Breaches on
// thin volume are ignored and the walk continues, so a later confirmed
// break still flips the level.
// =============================================================================

use serde::Serialize;

use crate::indicators::{atr, pivot_highs, pivot_lows, round_to, volume_ma_at};
use crate::market_data::Candle;
use crate::types::Timeframe;

/// Which side a level currently defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelRole {
    Support,
    Resistance,
}

impl LevelRole {
    fn flipped(self) -> Self {
        match self {
            Self::Support => Self::Resistance,
            Self::Resistance => Self::Support,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Level {
    pub price: f64,
    /// Latest cluster member's bar index.
    pub bar_index: usize,
    /// Immutable after creation.
    pub origin_role: LevelRole,
    /// Flips exactly once, at `broken_at_bar`.
    pub current_role: LevelRole,
    pub broken: bool,
    pub broken_at_bar: Option<usize>,
    /// Cluster size.
    pub touches: usize,
    pub volume_at_level: f64,
    pub zone_low: f64,
    pub zone_high: f64,
    /// 1 / (1 + age / decay), decay = 50 bars.
    pub recency: f64,
    pub round_bonus: f64,
    pub near_round_number: bool,
    /// Composite 0..1.
    pub strength: f64,
    /// Other configured TFs hosting a near-coincident level.
    pub confluence_timeframes: Vec<Timeframe>,
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneSettings {
    pub pivot_left: usize,
    pub pivot_right: usize,
    /// Pivots within this fraction of the cluster reference merge (0.002 = 0.2%).
    pub cluster_threshold_pct: f64,
    /// `None` keeps every level.
    pub max_levels: Option<usize>,
    pub recent_flip_lookback_bars: usize,
    pub volume_confirm_ratio: f64,
    pub volume_ma_period: usize,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            pivot_left: 3,
            pivot_right: 3,
            cluster_threshold_pct: 0.002,
            max_levels: Some(12),
            recent_flip_lookback_bars: 20,
            volume_confirm_ratio: 0.5,
            volume_ma_period: 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZoneReport {
    pub levels: Vec<Level>,
    pub nearest_support: Option<Level>,
    pub nearest_resistance: Option<Level>,
    pub zone_low: Option<f64>,
    pub zone_high: Option<f64>,
    pub in_zone: bool,
    pub at_support_zone: bool,
    pub at_resistance_zone: bool,
    pub close: f64,
    pub recent_flips: Vec<Level>,
    pub distance_to_support_pct: Option<f64>,
    pub distance_to_resistance_pct: Option<f64>,
    pub levels_with_confluence: usize,
}

const RECENCY_DECAY_BARS: f64 = 50.0;
const ROUND_NEAR_PCT: f64 = 0.001;
const ZONE_ATR_MULT: f64 = 0.5;
const VOLUME_MARGIN_PCT_MIN: f64 = 0.001;

/// Cluster like-kind pivots by price proximity. The reference price is the
/// first member of the running cluster; the cluster price is the median.
fn cluster_pivots(
    pivots: &[(f64, usize)],
    origin: LevelRole,
    threshold_pct: f64,
) -> Vec<Level> {
    if pivots.is_empty() {
        return Vec::new();
    }
    let mut sorted = pivots.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut clusters: Vec<Vec<(f64, usize)>> = Vec::new();
    let mut current = vec![sorted[0]];
    for &(price, idx) in &sorted[1..] {
        let ref_price = current[0].0;
        if ref_price > 0.0 && (price - ref_price).abs() / ref_price <= threshold_pct {
            current.push((price, idx));
        } else {
            clusters.push(std::mem::replace(&mut current, vec![(price, idx)]));
        }
    }
    clusters.push(current);

    clusters
        .into_iter()
        .map(|members| {
            let mut prices: Vec<f64> = members.iter().map(|m| m.0).collect();
            prices.sort_by(f64::total_cmp);
            let median_price = prices[prices.len() / 2];
            let last_bar = members.iter().map(|m| m.1).max().unwrap_or(0);
            Level {
                price: median_price,
                bar_index: last_bar,
                origin_role: origin,
                current_role: origin,
                broken: false,
                broken_at_bar: None,
                touches: members.len(),
                volume_at_level: 0.0,
                zone_low: median_price,
                zone_high: median_price,
                recency: 1.0,
                round_bonus: 0.0,
                near_round_number: false,
                strength: 0.0,
                confluence_timeframes: Vec::new(),
            }
        })
        .collect()
}

/// Volume traded through each level's band plus the ±ATR zone bounds.
fn enrich_volume_and_zone(levels: &mut [Level], candles: &[Candle]) {
    let atr_val = atr(candles, 14)
        .filter(|v| *v > 0.0)
        .or_else(|| candles.last().map(|c| c.high - c.low))
        .unwrap_or(0.0);
    let half = ZONE_ATR_MULT * atr_val;
    for level in levels.iter_mut() {
        if level.price <= 0.0 {
            continue;
        }
        let margin = (VOLUME_MARGIN_PCT_MIN * level.price).max(half);
        let lo = level.price - margin;
        let hi = level.price + margin;
        level.volume_at_level = candles
            .iter()
            .filter(|c| c.low <= hi && c.high >= lo)
            .map(|c| c.volume)
            .sum();
        level.zone_low = level.price - half;
        level.zone_high = level.price + half;
    }
}

/// Round-number proximity: step 1000 at >= 100k, 500 at >= 10k, else 1% of
/// price floored at 50. Bonus decays linearly to zero at 0.1% distance.
fn enrich_round_bonus(levels: &mut [Level]) {
    for level in levels.iter_mut() {
        if level.price <= 0.0 {
            continue;
        }
        let step = if level.price >= 100_000.0 {
            1_000.0
        } else if level.price >= 10_000.0 {
            500.0
        } else {
            (level.price * 0.01).max(50.0)
        };
        let nearest = (level.price / step).round() * step;
        let dist_pct = (level.price - nearest).abs() / level.price;
        level.near_round_number = dist_pct <= ROUND_NEAR_PCT;
        level.round_bonus = round_to((1.0 - dist_pct / ROUND_NEAR_PCT).max(0.0).min(1.0), 3);
    }
}

fn enrich_recency(levels: &mut [Level], n_bars: usize) {
    for level in levels.iter_mut() {
        let age = n_bars.saturating_sub(1).saturating_sub(level.bar_index) as f64;
        level.recency = round_to(1.0 / (1.0 + age / RECENCY_DECAY_BARS), 4);
    }
}

/// Composite strength: touches .35, volume .25, recency .25, round .15.
fn apply_composite_strength(levels: &mut [Level]) {
    let touches_max = levels.iter().map(|l| l.touches).max().unwrap_or(1).max(1) as f64;
    let mut vols: Vec<f64> = levels.iter().map(|l| l.volume_at_level).collect();
    vols.sort_by(f64::total_cmp);
    let median_vol = vols.get(vols.len() / 2).copied().unwrap_or(0.0);
    for level in levels.iter_mut() {
        let touches_norm = (level.touches as f64 / touches_max).min(1.0);
        let volume_ratio = if median_vol > 0.0 {
            (level.volume_at_level / median_vol).min(1.0)
        } else {
            0.0
        };
        let strength = 0.35 * touches_norm
            + 0.25 * volume_ratio
            + 0.25 * level.recency
            + 0.15 * level.round_bonus;
        level.strength = round_to(strength.clamp(0.0, 1.0), 3);
    }
}

/// Walk each level forward from its formation bar and flip the role at the
/// first volume-confirmed breaching close. Thin-volume breaches do not
/// flip and do not end the walk.
fn assign_current_roles(levels: &mut [Level], candles: &[Candle], settings: &ZoneSettings) {
    for level in levels.iter_mut() {
        for (j, candle) in candles.iter().enumerate().skip(level.bar_index + 1) {
            let breached = match level.origin_role {
                LevelRole::Resistance => candle.close > level.price,
                LevelRole::Support => candle.close < level.price,
            };
            if !breached {
                continue;
            }
            let avg_vol = volume_ma_at(candles, j, settings.volume_ma_period);
            if avg_vol <= 0.0 || candle.volume >= settings.volume_confirm_ratio * avg_vol {
                level.broken = true;
                level.broken_at_bar = Some(j);
                level.current_role = level.origin_role.flipped();
                break;
            }
        }
    }
}

/// Full zone detection over one candle window (oldest-first).
pub fn detect_trading_zones(candles: &[Candle], settings: &ZoneSettings) -> ZoneReport {
    let min_len = settings.pivot_left + settings.pivot_right + 1;
    let Some(last) = candles.last() else {
        return ZoneReport::default();
    };
    let close = last.close;
    if candles.len() < min_len || close <= 0.0 {
        return ZoneReport {
            close,
            ..ZoneReport::default()
        };
    }

    let lows = pivot_lows(candles, settings.pivot_left, settings.pivot_right);
    let highs = pivot_highs(candles, settings.pivot_left, settings.pivot_right);
    let mut levels = cluster_pivots(&lows, LevelRole::Support, settings.cluster_threshold_pct);
    levels.extend(cluster_pivots(
        &highs,
        LevelRole::Resistance,
        settings.cluster_threshold_pct,
    ));
    if levels.is_empty() {
        return ZoneReport {
            close,
            ..ZoneReport::default()
        };
    }

    enrich_volume_and_zone(&mut levels, candles);
    enrich_round_bonus(&mut levels);
    enrich_recency(&mut levels, candles.len());
    apply_composite_strength(&mut levels);

    levels.sort_by(|a, b| {
        b.strength
            .total_cmp(&a.strength)
            .then(b.bar_index.cmp(&a.bar_index))
    });
    if let Some(max) = settings.max_levels {
        levels.truncate(max);
    }

    assign_current_roles(&mut levels, candles, settings);

    let nearest_support = levels
        .iter()
        .filter(|l| l.current_role == LevelRole::Support && l.price < close)
        .max_by(|a, b| a.price.total_cmp(&b.price))
        .cloned();
    let nearest_resistance = levels
        .iter()
        .filter(|l| l.current_role == LevelRole::Resistance && l.price > close)
        .min_by(|a, b| a.price.total_cmp(&b.price))
        .cloned();

    let zone_low = nearest_support.as_ref().map(|l| l.price);
    let zone_high = nearest_resistance.as_ref().map(|l| l.price);
    let in_zone = matches!((zone_low, zone_high), (Some(lo), Some(hi)) if lo <= close && close <= hi);
    let at_support_zone = nearest_support
        .as_ref()
        .is_some_and(|l| l.zone_low <= close && close <= l.zone_high);
    let at_resistance_zone = nearest_resistance
        .as_ref()
        .is_some_and(|l| l.zone_low <= close && close <= l.zone_high);

    let distance_to_support_pct = nearest_support
        .as_ref()
        .filter(|l| l.price > 0.0)
        .map(|l| round_to((close - l.price) / close, 4));
    let distance_to_resistance_pct = nearest_resistance
        .as_ref()
        .filter(|l| l.price > 0.0)
        .map(|l| round_to((l.price - close) / close, 4));

    let from_bar = candles.len().saturating_sub(settings.recent_flip_lookback_bars);
    let recent_flips: Vec<Level> = levels
        .iter()
        .filter(|l| l.broken && l.broken_at_bar.is_some_and(|b| b >= from_bar))
        .cloned()
        .collect();

    ZoneReport {
        levels,
        nearest_support,
        nearest_resistance,
        zone_low,
        zone_high,
        in_zone,
        at_support_zone,
        at_resistance_zone,
        close,
        recent_flips,
        distance_to_support_pct,
        distance_to_resistance_pct,
        levels_with_confluence: 0,
    }
}

/// Cross-TF confluence: re-run the model on every other configured TF and
/// mark each highest-TF level with the TFs hosting a level within
/// `cluster_threshold_pct` of its price.
pub fn mark_confluence(
    report: &mut ZoneReport,
    highest_tf: Timeframe,
    others: &[(Timeframe, Vec<Candle>)],
    settings: &ZoneSettings,
) {
    for level in report.levels.iter_mut() {
        level.confluence_timeframes = vec![highest_tf];
    }
    for (tf, candles) in others {
        if *tf == highest_tf || candles.len() < 15 {
            continue;
        }
        let other = detect_trading_zones(candles, settings);
        let other_prices: Vec<f64> = other.levels.iter().map(|l| l.price).collect();
        for level in report.levels.iter_mut() {
            if level.price <= 0.0 {
                continue;
            }
            let near = other_prices
                .iter()
                .any(|p| (p - level.price).abs() / level.price <= settings.cluster_threshold_pct);
            if near && !level.confluence_timeframes.contains(tf) {
                level.confluence_timeframes.push(*tf);
            }
        }
    }
    report.levels_with_confluence = report
        .levels
        .iter()
        .filter(|l| l.confluence_timeframes.len() >= 2)
        .count();
}
