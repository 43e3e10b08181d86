// =============================================================================
// Order-flow engine — DOM, time & sales, volume delta, sweeps, absorption
// =============================================================================
//
// Works on the live book snapshot, the trade tape window, and the lowest-TF
// candle tail. Everything here is a pure function of its inputs; the control
// loop decides when to call it and what window to pass.
// =============================================================================

use serde::Serialize;

use crate::market_data::{BookSnapshot, Candle, Trade};
use crate::types::SweepSide;

use super::zones::{LevelRole, ZoneReport};

#[derive(Debug, Clone, Copy)]
pub struct OrderflowSettings {
    /// Top-K depth levels considered per side.
    pub depth_levels: usize,
    /// A level is a "wall" above this percentile of combined sizes.
    pub wall_percentile: f64,
    /// Main aggregation window for T&S and delta.
    pub window_secs: f64,
    /// Second-half vs first-half multiple that flags a volume spike.
    pub volume_spike_mult: f64,
    /// Candles inspected for sweeps.
    pub sweep_lookback_bars: usize,
    /// Wick must be at least this multiple of the body to count as a sweep.
    pub wick_ratio_min: f64,
    /// Short "what is happening right now" window; 0 disables.
    pub short_window_secs: f64,
    /// Prints considered for the tape bias.
    pub last_trades_k: usize,
    /// Buy/sell dominance multiple for the tape bias.
    pub bias_ratio_min: f64,
    /// Side total shrinking below this ratio of its prior value = absorption.
    pub min_drop_ratio: f64,
    /// |delta_ratio| needed before a divergence is flagged.
    pub divergence_threshold: f64,
    /// Price bucket for trades-by-level aggregation.
    pub bucket_tick: f64,
    /// Hot levels kept from the per-level aggregation.
    pub hot_levels_top_n: usize,
}

impl Default for OrderflowSettings {
    fn default() -> Self {
        Self {
            depth_levels: 20,
            wall_percentile: 90.0,
            window_secs: 60.0,
            volume_spike_mult: 2.0,
            sweep_lookback_bars: 5,
            wick_ratio_min: 0.5,
            short_window_secs: 20.0,
            last_trades_k: 10,
            bias_ratio_min: 1.2,
            min_drop_ratio: 0.7,
            divergence_threshold: 0.1,
            bucket_tick: 0.1,
            hot_levels_top_n: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// DOM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DomLevel {
    pub price: f64,
    pub size: f64,
    pub side: SweepSide,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomAnalysis {
    pub walls_bid: Vec<DomLevel>,
    pub walls_ask: Vec<DomLevel>,
    /// Bid share of top-K volume, 0..1; 0.5 = balanced.
    pub imbalance_ratio: f64,
    pub raw_bid_volume: f64,
    pub raw_ask_volume: f64,
}

impl DomAnalysis {
    pub fn significant_levels(&self) -> impl Iterator<Item = &DomLevel> {
        self.walls_bid.iter().chain(self.walls_ask.iter())
    }
}

/// Size at the `percentile`-th rank of the combined side sizes.
fn wall_threshold(sizes: &mut Vec<f64>, percentile: f64) -> f64 {
    if sizes.is_empty() {
        return 0.0;
    }
    if sizes.len() == 1 {
        return sizes[0];
    }
    sizes.sort_by(f64::total_cmp);
    let idx = ((sizes.len() as f64 * percentile / 100.0) as usize).min(sizes.len() - 1);
    sizes[idx]
}

/// Depth imbalance and walls over the top-K levels each side.
pub fn analyze_dom(snapshot: &BookSnapshot, settings: &OrderflowSettings) -> DomAnalysis {
    let bids: Vec<(f64, f64)> = snapshot
        .bids
        .iter()
        .take(settings.depth_levels)
        .filter(|(_, s)| *s > 0.0)
        .copied()
        .collect();
    let asks: Vec<(f64, f64)> = snapshot
        .asks
        .iter()
        .take(settings.depth_levels)
        .filter(|(_, s)| *s > 0.0)
        .copied()
        .collect();

    let bid_vol: f64 = bids.iter().map(|(_, s)| s).sum();
    let ask_vol: f64 = asks.iter().map(|(_, s)| s).sum();
    let total = bid_vol + ask_vol;
    let imbalance_ratio = if total > 0.0 { bid_vol / total } else { 0.5 };

    let mut all_sizes: Vec<f64> = bids.iter().chain(asks.iter()).map(|(_, s)| *s).collect();
    let threshold = wall_threshold(&mut all_sizes, settings.wall_percentile);

    let collect_walls = |levels: &[(f64, f64)], side: SweepSide| -> Vec<DomLevel> {
        if threshold <= 0.0 {
            return Vec::new();
        }
        levels
            .iter()
            .filter(|(_, s)| *s >= threshold)
            .map(|&(price, size)| DomLevel { price, size, side })
            .collect()
    };

    DomAnalysis {
        walls_bid: collect_walls(&bids, SweepSide::Bid),
        walls_ask: collect_walls(&asks, SweepSide::Ask),
        imbalance_ratio,
        raw_bid_volume: bid_vol,
        raw_ask_volume: ask_vol,
    }
}

// ---------------------------------------------------------------------------
// Time & Sales and volume delta
// ---------------------------------------------------------------------------

fn trades_in_window(trades: &[Trade], end_ms: i64, window_secs: f64) -> Vec<&Trade> {
    if window_secs <= 0.0 {
        return Vec::new();
    }
    let start_ms = end_ms - (window_secs * 1000.0) as i64;
    trades
        .iter()
        .filter(|t| t.time_ms >= start_ms && t.time_ms <= end_ms)
        .collect()
}

fn window_end(trades: &[Trade], now_ms: Option<i64>) -> i64 {
    now_ms.unwrap_or_else(|| trades.iter().map(|t| t.time_ms).max().unwrap_or(0))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeAndSales {
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub volume_per_sec: f64,
    /// Second half of the window traded `volume_spike_mult`x the first half.
    pub is_volume_spike: bool,
    pub trades_count: usize,
}

pub fn analyze_time_and_sales(
    trades: &[Trade],
    now_ms: Option<i64>,
    settings: &OrderflowSettings,
) -> TimeAndSales {
    if trades.is_empty() {
        return TimeAndSales::default();
    }
    let end_ms = window_end(trades, now_ms);
    let in_window = trades_in_window(trades, end_ms, settings.window_secs);
    let half_begin = end_ms - (settings.window_secs * 500.0) as i64;

    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;
    let mut vol_first = 0.0;
    let mut vol_second = 0.0;
    for t in &in_window {
        if t.is_buy {
            buy_volume += t.size;
        } else {
            sell_volume += t.size;
        }
        if t.time_ms < half_begin {
            vol_first += t.size;
        } else {
            vol_second += t.size;
        }
    }
    let total_volume = buy_volume + sell_volume;

    TimeAndSales {
        total_volume,
        buy_volume,
        sell_volume,
        volume_per_sec: if settings.window_secs > 0.0 {
            total_volume / settings.window_secs
        } else {
            0.0
        },
        is_volume_spike: settings.volume_spike_mult > 0.0
            && vol_first > 0.0
            && vol_second >= settings.volume_spike_mult * vol_first,
        trades_count: in_window.len(),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeDelta {
    /// buy - sell over the window.
    pub delta: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// delta / (buy + sell), in [-1, 1].
    pub delta_ratio: f64,
    pub first_half_delta_ratio: f64,
    pub second_half_delta_ratio: f64,
    pub trades_count: usize,
}

pub fn compute_volume_delta(trades: &[Trade], now_ms: Option<i64>, window_secs: f64) -> VolumeDelta {
    if trades.is_empty() {
        return VolumeDelta::default();
    }
    let end_ms = window_end(trades, now_ms);
    let in_window = trades_in_window(trades, end_ms, window_secs);
    let half_begin = end_ms - (window_secs * 500.0) as i64;

    let mut buy = 0.0;
    let mut sell = 0.0;
    let (mut b1, mut s1, mut b2, mut s2) = (0.0, 0.0, 0.0, 0.0);
    for t in &in_window {
        if t.is_buy {
            buy += t.size;
        } else {
            sell += t.size;
        }
        if t.time_ms < half_begin {
            if t.is_buy {
                b1 += t.size;
            } else {
                s1 += t.size;
            }
        } else if t.is_buy {
            b2 += t.size;
        } else {
            s2 += t.size;
        }
    }
    let ratio = |b: f64, s: f64| {
        let total = b + s;
        if total > 0.0 {
            (b - s) / total
        } else {
            0.0
        }
    };

    VolumeDelta {
        delta: buy - sell,
        buy_volume: buy,
        sell_volume: sell,
        delta_ratio: ratio(buy, sell),
        first_half_delta_ratio: ratio(b1, s1),
        second_half_delta_ratio: ratio(b2, s2),
        trades_count: in_window.len(),
    }
}

// ---------------------------------------------------------------------------
// Delta-price divergence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeltaPriceDivergence {
    /// Price up while delta is firmly negative.
    pub bearish: bool,
    /// Price down while delta is firmly positive.
    pub bullish: bool,
    pub first_price: Option<f64>,
    pub last_price: Option<f64>,
    pub delta_ratio: f64,
}

pub fn compute_delta_price_divergence(
    trades: &[Trade],
    now_ms: Option<i64>,
    window_secs: f64,
    threshold: f64,
) -> DeltaPriceDivergence {
    let mut out = DeltaPriceDivergence::default();
    if trades.is_empty() || window_secs <= 0.0 {
        return out;
    }
    let end_ms = window_end(trades, now_ms);
    let in_window = trades_in_window(trades, end_ms, window_secs);
    if in_window.len() < 2 {
        return out;
    }
    let delta = compute_volume_delta(trades, Some(end_ms), window_secs);
    out.delta_ratio = delta.delta_ratio;

    let first_price = in_window.first().map(|t| t.price).unwrap_or(0.0);
    let last_price = in_window.last().map(|t| t.price).unwrap_or(0.0);
    if first_price <= 0.0 || last_price <= 0.0 {
        return out;
    }
    out.first_price = Some(first_price);
    out.last_price = Some(last_price);
    out.bearish = last_price > first_price && delta.delta_ratio <= -threshold;
    out.bullish = last_price < first_price && delta.delta_ratio >= threshold;
    out
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SweepEvent {
    pub level: f64,
    pub start_time: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Sweeps {
    pub recent_sweeps_bid: Vec<SweepEvent>,
    pub recent_sweeps_ask: Vec<SweepEvent>,
    pub last_sweep_side: Option<SweepSide>,
    pub last_sweep_time: Option<i64>,
}

/// Detect wick-through-and-close-back-inside moves against the given
/// support/resistance prices over the last `sweep_lookback_bars` candles.
pub fn detect_sweeps(
    candles: &[Candle],
    supports: &[f64],
    resistances: &[f64],
    settings: &OrderflowSettings,
) -> Sweeps {
    let mut out = Sweeps::default();
    if candles.is_empty() || (supports.is_empty() && resistances.is_empty()) {
        return out;
    }
    let bars = &candles[candles.len().saturating_sub(settings.sweep_lookback_bars)..];
    let mut last_ts = i64::MIN;
    for c in bars {
        let body = c.body().max(1e-12);
        for &level in supports {
            if c.low < level && level < c.close && c.lower_wick() >= settings.wick_ratio_min * body {
                out.recent_sweeps_bid.push(SweepEvent {
                    level,
                    start_time: c.start_time,
                });
                if c.start_time > last_ts {
                    last_ts = c.start_time;
                    out.last_sweep_side = Some(SweepSide::Bid);
                    out.last_sweep_time = Some(c.start_time);
                }
            }
        }
        for &level in resistances {
            if c.high > level && level > c.close && c.upper_wick() >= settings.wick_ratio_min * body
            {
                out.recent_sweeps_ask.push(SweepEvent {
                    level,
                    start_time: c.start_time,
                });
                if c.start_time > last_ts {
                    last_ts = c.start_time;
                    out.last_sweep_side = Some(SweepSide::Ask);
                    out.last_sweep_time = Some(c.start_time);
                }
            }
        }
    }
    out
}

/// Collect sweep reference prices from DOM walls and zone levels.
pub fn sweep_levels(dom: Option<&DomAnalysis>, zones: Option<&ZoneReport>) -> (Vec<f64>, Vec<f64>) {
    let mut supports = Vec::new();
    let mut resistances = Vec::new();
    if let Some(dom) = dom {
        for wall in dom.significant_levels() {
            match wall.side {
                SweepSide::Bid => supports.push(wall.price),
                SweepSide::Ask => resistances.push(wall.price),
            }
        }
    }
    if let Some(zones) = zones {
        for level in &zones.levels {
            match level.current_role {
                LevelRole::Support => supports.push(level.price),
                LevelRole::Resistance => resistances.push(level.price),
            }
        }
    }
    (supports, resistances)
}

// ---------------------------------------------------------------------------
// Absorption
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct Absorption {
    pub absorption_bid: bool,
    pub absorption_ask: bool,
    pub bid_volume_before: Option<f64>,
    pub bid_volume_after: Option<f64>,
    pub ask_volume_before: Option<f64>,
    pub ask_volume_after: Option<f64>,
    pub bid_drop_ratio: Option<f64>,
    pub ask_drop_ratio: Option<f64>,
    /// Buyers ate through the ask while the last block was a buy.
    pub absorption_bullish: bool,
    /// Sellers ate through the bid while the last block was a sell.
    pub absorption_bearish: bool,
}

fn side_total(levels: &[(f64, f64)], depth: usize) -> f64 {
    levels.iter().take(depth).map(|(_, s)| s).sum()
}

/// Compare top-K totals between two snapshots; a side shrinking below
/// `min_drop_ratio` of its prior total was absorbed.
pub fn analyze_absorption(
    prev: Option<&BookSnapshot>,
    current: &BookSnapshot,
    last_block_is_buy: Option<bool>,
    settings: &OrderflowSettings,
) -> Absorption {
    let mut out = Absorption {
        bid_volume_after: Some(side_total(&current.bids, settings.depth_levels)),
        ask_volume_after: Some(side_total(&current.asks, settings.depth_levels)),
        ..Absorption::default()
    };
    let Some(prev) = prev else {
        return out;
    };
    let bid_before = side_total(&prev.bids, settings.depth_levels);
    let ask_before = side_total(&prev.asks, settings.depth_levels);
    out.bid_volume_before = Some(bid_before);
    out.ask_volume_before = Some(ask_before);

    if bid_before > 0.0 {
        let ratio = out.bid_volume_after.unwrap_or(0.0) / bid_before;
        out.bid_drop_ratio = Some(ratio);
        out.absorption_bid = ratio < settings.min_drop_ratio;
    }
    if ask_before > 0.0 {
        let ratio = out.ask_volume_after.unwrap_or(0.0) / ask_before;
        out.ask_drop_ratio = Some(ratio);
        out.absorption_ask = ratio < settings.min_drop_ratio;
    }
    if let Some(is_buy) = last_block_is_buy {
        out.absorption_bullish = out.absorption_ask && is_buy;
        out.absorption_bearish = out.absorption_bid && !is_buy;
    }
    out
}

// ---------------------------------------------------------------------------
// Tape bias
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeBias {
    Buy,
    Sell,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastTrades {
    pub bias: TapeBias,
    /// Aggressor of the very last print.
    pub last_block_is_buy: Option<bool>,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub count: usize,
}

impl Default for LastTrades {
    fn default() -> Self {
        Self {
            bias: TapeBias::Neutral,
            last_block_is_buy: None,
            buy_volume: 0.0,
            sell_volume: 0.0,
            count: 0,
        }
    }
}

pub fn last_trades_and_block(trades: &[Trade], settings: &OrderflowSettings) -> LastTrades {
    if trades.is_empty() || settings.last_trades_k == 0 {
        return LastTrades::default();
    }
    let last = &trades[trades.len().saturating_sub(settings.last_trades_k)..];
    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;
    for t in last {
        if t.is_buy {
            buy_volume += t.size;
        } else {
            sell_volume += t.size;
        }
    }
    let bias = if buy_volume + sell_volume <= 0.0 {
        TapeBias::Neutral
    } else if (sell_volume > 0.0 && buy_volume >= settings.bias_ratio_min * sell_volume)
        || (buy_volume > 0.0 && sell_volume == 0.0)
    {
        TapeBias::Buy
    } else if (buy_volume > 0.0 && sell_volume >= settings.bias_ratio_min * buy_volume)
        || (sell_volume > 0.0 && buy_volume == 0.0)
    {
        TapeBias::Sell
    } else {
        TapeBias::Neutral
    };

    LastTrades {
        bias,
        last_block_is_buy: last.last().map(|t| t.is_buy),
        buy_volume,
        sell_volume,
        count: last.len(),
    }
}

// ---------------------------------------------------------------------------
// Trades by price level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PriceLevelVolume {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub total_volume: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradesByLevel {
    /// Sorted by total volume, descending.
    pub volume_by_level: Vec<PriceLevelVolume>,
    pub hot_levels: Vec<PriceLevelVolume>,
}

/// Bucket window prints by price tick; the busiest buckets become the "hot"
/// levels the sandbox refuses to chase into.
pub fn trades_by_level(
    trades: &[Trade],
    now_ms: Option<i64>,
    settings: &OrderflowSettings,
) -> TradesByLevel {
    if trades.is_empty() || settings.bucket_tick <= 0.0 {
        return TradesByLevel::default();
    }
    let end_ms = window_end(trades, now_ms);
    let in_window = trades_in_window(trades, end_ms, settings.window_secs);

    let mut buckets: std::collections::HashMap<i64, (f64, f64)> = std::collections::HashMap::new();
    for t in in_window {
        if t.price <= 0.0 {
            continue;
        }
        let key = (t.price / settings.bucket_tick).round() as i64;
        let entry = buckets.entry(key).or_insert((0.0, 0.0));
        if t.is_buy {
            entry.0 += t.size;
        } else {
            entry.1 += t.size;
        }
    }
    let mut volume_by_level: Vec<PriceLevelVolume> = buckets
        .into_iter()
        .map(|(key, (buy, sell))| PriceLevelVolume {
            price: key as f64 * settings.bucket_tick,
            buy_volume: buy,
            sell_volume: sell,
            total_volume: buy + sell,
        })
        .collect();
    volume_by_level.sort_by(|a, b| b.total_volume.total_cmp(&a.total_volume));
    let hot_levels = volume_by_level
        .iter()
        .take(settings.hot_levels_top_n)
        .cloned()
        .collect();
    TradesByLevel {
        volume_by_level,
        hot_levels,
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderflowReport {
    pub dom: Option<DomAnalysis>,
    pub time_and_sales: Option<TimeAndSales>,
    pub volume_delta: Option<VolumeDelta>,
    pub sweeps: Option<Sweeps>,
    pub trades_by_level: TradesByLevel,
    pub short_window_delta: Option<VolumeDelta>,
    pub delta_price_divergence: Option<DeltaPriceDivergence>,
    pub last_trades: Option<LastTrades>,
    pub absorption: Option<Absorption>,
}

/// One-call bundle used by the control loop each tick.
pub fn analyze_orderflow(
    book: Option<&BookSnapshot>,
    prev_book: Option<&BookSnapshot>,
    trades: &[Trade],
    candles: &[Candle],
    zones: Option<&ZoneReport>,
    now_ms: Option<i64>,
    settings: &OrderflowSettings,
) -> OrderflowReport {
    let dom = book.map(|b| analyze_dom(b, settings));
    let time_and_sales = (!trades.is_empty())
        .then(|| analyze_time_and_sales(trades, now_ms, settings));
    let volume_delta =
        (!trades.is_empty()).then(|| compute_volume_delta(trades, now_ms, settings.window_secs));

    let sweeps = (!candles.is_empty()).then(|| {
        let (supports, resistances) = sweep_levels(dom.as_ref(), zones);
        detect_sweeps(candles, &supports, &resistances, settings)
    });

    let trades_by_level_result = trades_by_level(trades, now_ms, settings);

    let (short_window_delta, delta_price_divergence) =
        if settings.short_window_secs > 0.0 && !trades.is_empty() {
            (
                Some(compute_volume_delta(trades, now_ms, settings.short_window_secs)),
                Some(compute_delta_price_divergence(
                    trades,
                    now_ms,
                    settings.short_window_secs,
                    settings.divergence_threshold,
                )),
            )
        } else {
            (None, None)
        };

    let last_trades =
        (!trades.is_empty()).then(|| last_trades_and_block(trades, settings));

    let absorption = book.map(|current| {
        analyze_absorption(
            prev_book,
            current,
            last_trades.as_ref().and_then(|lt| lt.last_block_is_buy),
            settings,
        )
    });

    OrderflowReport {
        dom,
        time_and_sales,
        volume_delta,
        sweeps,
        trades_by_level: trades_by_level_result,
        short_window_delta,
        delta_price_divergence,
        last_trades,
        absorption,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(time_ms: i64, is_buy: bool, size: f64, price: f64) -> Trade {
        Trade {
            time_ms,
            is_buy,
            size,
            price,
            id: String::new(),
            seq: 0,
        }
    }

    fn book(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> BookSnapshot {
        BookSnapshot {
            symbol: "BTCUSDT".into(),
            bids,
            asks,
            ts: 0,
            update_id: 0,
            seq: 0,
        }
    }

    #[test]
    fn imbalance_bounds_and_balance() {
        let settings = OrderflowSettings::default();
        let balanced = analyze_dom(&book(vec![(100.0, 5.0)], vec![(101.0, 5.0)]), &settings);
        assert!((balanced.imbalance_ratio - 0.5).abs() < 1e-9);

        let bid_heavy = analyze_dom(&book(vec![(100.0, 9.0)], vec![(101.0, 1.0)]), &settings);
        assert!((bid_heavy.imbalance_ratio - 0.9).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&bid_heavy.imbalance_ratio));

        let empty = analyze_dom(&book(vec![], vec![]), &settings);
        assert!((empty.imbalance_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn walls_exceed_percentile() {
        let settings = OrderflowSettings::default();
        let mut bids: Vec<(f64, f64)> = (0..19).map(|i| (100.0 - i as f64, 1.0)).collect();
        bids.push((80.0, 50.0)); // the wall
        let dom = analyze_dom(&book(bids, vec![(101.0, 1.0)]), &settings);
        assert_eq!(dom.walls_bid.len(), 1);
        assert!((dom.walls_bid[0].size - 50.0).abs() < 1e-9);
    }

    #[test]
    fn delta_is_buy_minus_sell_ratio_bounded() {
        let trades = vec![
            trade(1_000, true, 3.0, 100.0),
            trade(2_000, false, 1.0, 100.0),
            trade(3_000, true, 2.0, 100.0),
        ];
        let delta = compute_volume_delta(&trades, Some(3_000), 60.0);
        assert!((delta.delta - 4.0).abs() < 1e-9);
        assert!((delta.buy_volume - 5.0).abs() < 1e-9);
        assert!((delta.sell_volume - 1.0).abs() < 1e-9);
        assert!((-1.0..=1.0).contains(&delta.delta_ratio));
        assert!((delta.delta_ratio - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn volume_spike_needs_heavy_second_half() {
        let settings = OrderflowSettings::default();
        // 60s window ending at t=60s: first half light, second half 3x.
        let mut trades = vec![trade(10_000, true, 1.0, 100.0)];
        trades.push(trade(50_000, true, 3.0, 100.0));
        let tns = analyze_time_and_sales(&trades, Some(60_000), &settings);
        assert!(tns.is_volume_spike);

        // Balanced halves: no spike.
        let trades = vec![trade(10_000, true, 2.0, 100.0), trade(50_000, true, 2.0, 100.0)];
        let tns = analyze_time_and_sales(&trades, Some(60_000), &settings);
        assert!(!tns.is_volume_spike);
    }

    #[test]
    fn divergence_price_up_delta_down() {
        // Price rises while sells dominate the window.
        let trades = vec![
            trade(1_000, false, 5.0, 100.0),
            trade(2_000, false, 5.0, 100.5),
            trade(3_000, true, 2.0, 101.0),
        ];
        let div = compute_delta_price_divergence(&trades, Some(3_000), 20.0, 0.1);
        assert!(div.bearish);
        assert!(!div.bullish);
        assert!(div.delta_ratio < 0.0);
    }

    #[test]
    fn sweep_bid_detected_on_wick_through_support() {
        // Candle pierces support at 100 with a long lower wick, closes back above.
        let candles = vec![Candle::new(10_000, 101.0, 101.5, 98.0, 100.8, 10.0)];
        let settings = OrderflowSettings::default();
        let sweeps = detect_sweeps(&candles, &[100.0], &[], &settings);
        assert_eq!(sweeps.last_sweep_side, Some(SweepSide::Bid));
        assert_eq!(sweeps.last_sweep_time, Some(10_000));
        assert_eq!(sweeps.recent_sweeps_bid.len(), 1);
    }

    #[test]
    fn sweep_requires_wick_not_body() {
        // Full-body breakdown through the level: close below, not a sweep.
        let candles = vec![Candle::new(10_000, 101.0, 101.5, 98.0, 98.5, 10.0)];
        let settings = OrderflowSettings::default();
        let sweeps = detect_sweeps(&candles, &[100.0], &[], &settings);
        assert!(sweeps.last_sweep_side.is_none());
    }

    #[test]
    fn absorption_ask_eaten_by_buyers() {
        let settings = OrderflowSettings::default();
        let prev = book(vec![(100.0, 10.0)], vec![(101.0, 10.0)]);
        let current = book(vec![(100.0, 10.0)], vec![(101.0, 3.0)]); // ask sank to 30%
        let result = analyze_absorption(Some(&prev), &current, Some(true), &settings);
        assert!(result.absorption_ask);
        assert!(!result.absorption_bid);
        assert!(result.absorption_bullish);
        assert!(!result.absorption_bearish);
        assert!((result.ask_drop_ratio.unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn tape_bias_cases() {
        let settings = OrderflowSettings::default();
        let buys = vec![trade(1, true, 5.0, 100.0), trade(2, false, 1.0, 100.0)];
        assert_eq!(last_trades_and_block(&buys, &settings).bias, TapeBias::Buy);

        let sells = vec![trade(1, false, 5.0, 100.0), trade(2, true, 1.0, 100.0)];
        let lt = last_trades_and_block(&sells, &settings);
        assert_eq!(lt.bias, TapeBias::Sell);
        assert_eq!(lt.last_block_is_buy, Some(true));

        let buy_only = vec![trade(1, true, 5.0, 100.0)];
        assert_eq!(last_trades_and_block(&buy_only, &settings).bias, TapeBias::Buy);

        let balanced = vec![trade(1, true, 1.0, 100.0), trade(2, false, 1.0, 100.0)];
        assert_eq!(
            last_trades_and_block(&balanced, &settings).bias,
            TapeBias::Neutral
        );
    }

    #[test]
    fn hot_levels_rank_by_total_volume() {
        let settings = OrderflowSettings::default();
        let trades = vec![
            trade(1_000, true, 1.0, 100.0),
            trade(2_000, false, 5.0, 100.0),
            trade(3_000, true, 2.0, 105.0),
        ];
        let result = trades_by_level(&trades, Some(3_000), &settings);
        assert_eq!(result.volume_by_level.len(), 2);
        assert!((result.volume_by_level[0].price - 100.0).abs() < 1e-9);
        assert!((result.volume_by_level[0].total_volume - 6.0).abs() < 1e-9);
        assert_eq!(result.hot_levels.len(), 2);
    }

    #[test]
    fn aggregate_bundles_all_sections() {
        let settings = OrderflowSettings::default();
        let current = book(vec![(100.0, 10.0)], vec![(101.0, 10.0)]);
        let trades = vec![trade(59_000, true, 5.0, 100.5)];
        let candles = vec![Candle::new(0, 100.0, 101.0, 99.0, 100.5, 10.0)];
        let report = analyze_orderflow(
            Some(&current),
            None,
            &trades,
            &candles,
            None,
            Some(60_000),
            &settings,
        );
        assert!(report.dom.is_some());
        assert!(report.volume_delta.is_some());
        assert!(report.time_and_sales.is_some());
        assert!(report.sweeps.is_some());
        assert!(report.short_window_delta.is_some());
        assert!(report.last_trades.is_some());
        assert!(report.absorption.is_some());
    }
}
