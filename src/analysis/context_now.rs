// =============================================================================
// Context "here and now" — level proximity + short-window flow
// =============================================================================
//
// Prop-desk style gate: is price sitting at a meaningful level, and is the
// short-window flow pushing away from it? `allowed_long` needs support
// underfoot plus bullish flow (or bullish absorption); `allowed_short` is
// symmetric at resistance.
// =============================================================================

use serde::Serialize;

use crate::indicators::round_to;
use crate::types::SweepSide;

use super::orderflow::{OrderflowReport, TapeBias};
use super::zones::ZoneReport;

#[derive(Debug, Clone, Copy)]
pub struct ContextNowSettings {
    /// Price within this fraction of a level counts as "at the level".
    pub level_distance_pct: f64,
    /// Short-window |delta_ratio| needed for directional flow.
    pub delta_ratio_min: f64,
    /// Use significant DOM walls instead of trading zones for the levels.
    pub use_dom_levels: bool,
}

impl Default for ContextNowSettings {
    fn default() -> Self {
        Self {
            level_distance_pct: 0.0015,
            delta_ratio_min: 0.12,
            use_dom_levels: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextNow {
    pub at_support: bool,
    pub at_resistance: bool,
    pub in_zone: bool,
    pub flow_bullish_now: bool,
    pub flow_bearish_now: bool,
    pub absorption_bullish: bool,
    pub absorption_bearish: bool,
    pub last_sweep_side: Option<SweepSide>,
    pub last_trades_bias: Option<TapeBias>,
    pub last_block_is_buy: Option<bool>,
    pub short_window_delta_ratio: f64,
    pub distance_to_support_pct: Option<f64>,
    pub distance_to_resistance_pct: Option<f64>,
    pub allowed_long: bool,
    pub allowed_short: bool,
}

pub fn compute_context_now(
    current_price: f64,
    of: &OrderflowReport,
    zones: Option<&ZoneReport>,
    settings: &ContextNowSettings,
) -> ContextNow {
    let mut ctx = ContextNow::default();
    if current_price <= 0.0 {
        return ctx;
    }

    if settings.use_dom_levels {
        if let Some(dom) = &of.dom {
            for wall in dom.significant_levels() {
                match wall.side {
                    SweepSide::Bid if wall.price < current_price => {
                        let dist = (current_price - wall.price) / current_price;
                        if dist <= settings.level_distance_pct {
                            ctx.at_support = true;
                        }
                    }
                    SweepSide::Ask if wall.price > current_price => {
                        let dist = (wall.price - current_price) / current_price;
                        if dist <= settings.level_distance_pct {
                            ctx.at_resistance = true;
                        }
                    }
                    _ => {}
                }
            }
        }
    } else if let Some(zones) = zones {
        if let Some(sup) = &zones.nearest_support {
            let dist = (current_price - sup.price) / current_price;
            ctx.distance_to_support_pct = Some(round_to(dist, 4));
            if sup.price > 0.0 && (0.0..=settings.level_distance_pct).contains(&dist) {
                ctx.at_support = true;
            } else if sup.zone_low <= current_price && current_price <= sup.zone_high {
                ctx.at_support = true;
            }
        }
        if let Some(res) = &zones.nearest_resistance {
            let dist = (res.price - current_price) / current_price;
            ctx.distance_to_resistance_pct = Some(round_to(dist, 4));
            if res.price > 0.0 && (0.0..=settings.level_distance_pct).contains(&dist) {
                ctx.at_resistance = true;
            } else if res.zone_low <= current_price && current_price <= res.zone_high {
                ctx.at_resistance = true;
            }
        }
        if let (Some(lo), Some(hi)) = (zones.zone_low, zones.zone_high) {
            ctx.in_zone = lo <= current_price && current_price <= hi;
        }
    }

    let short_ratio = of
        .short_window_delta
        .as_ref()
        .map_or(0.0, |d| d.delta_ratio);
    ctx.short_window_delta_ratio = round_to(short_ratio, 4);
    ctx.flow_bullish_now = short_ratio >= settings.delta_ratio_min;
    ctx.flow_bearish_now = short_ratio <= -settings.delta_ratio_min;

    ctx.last_sweep_side = of.sweeps.as_ref().and_then(|s| s.last_sweep_side);
    if let Some(lt) = &of.last_trades {
        ctx.last_trades_bias = Some(lt.bias);
        ctx.last_block_is_buy = lt.last_block_is_buy;
    }
    if let Some(absorption) = &of.absorption {
        ctx.absorption_bullish = absorption.absorption_bullish;
        ctx.absorption_bearish = absorption.absorption_bearish;
    }

    ctx.allowed_long = ctx.at_support && (ctx.flow_bullish_now || ctx.absorption_bullish);
    ctx.allowed_short = ctx.at_resistance && (ctx.flow_bearish_now || ctx.absorption_bearish);
    ctx
}
