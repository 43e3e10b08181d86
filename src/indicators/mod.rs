// =============================================================================
// Indicator kernel — pure functions over candle windows
// =============================================================================
//
// Every function here is deterministic and side-effect-free, works on f64
// throughout, and returns `None` when the window is too short or an input is
// non-finite. Nothing in this module panics on market data.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod obv;
pub mod pivots;
pub mod rsi;
pub mod structure;
pub mod volume;
pub mod vwap;

pub use adx::{adx, AdxReading};
pub use atr::atr;
pub use bollinger::bb_width;
pub use ema::{ema, ema_stack, EmaStack, EmaTrend};
pub use obv::obv_slope;
pub use pivots::{pivot_highs, pivot_lows};
pub use rsi::{rsi, rsi_divergence};
pub use structure::{
    bucket_structure, price_position_in_range, recent_return, spring_upthrust, trend_strength,
    zone_freshness,
};
pub use volume::{volume_at_range_bounds, volume_ma_at, volume_pressure_at_bounds, volume_ratio};
pub use vwap::vwap_rolling;

/// Clamp a score into `[0, 1]`.
pub fn clip_score(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Round to `digits` decimal places. Used only for report fields, never
/// inside running computations.
pub fn round_to(x: f64, digits: u32) -> f64 {
    let f = 10_f64.powi(digits as i32);
    (x * f).round() / f
}
