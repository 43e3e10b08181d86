// =============================================================================
// Exponential Moving Average + the 20/50/200 stack
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;

/// Last EMA value over `series` with the given `period`.
///
/// Seeded with the SMA of the first `period` values, then smoothed with
/// `k = 2 / (period + 1)`. Returns `None` when the series is shorter than
/// `period`, the period is zero, or any intermediate value is non-finite.
pub fn ema(series: &[f64], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut value: f64 = series[..period].iter().sum::<f64>() / period as f64;
    for &x in &series[period..] {
        value = x * k + value * (1.0 - k);
    }
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Relative ordering of price against the EMA 20/50/200 stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmaTrend {
    Bullish,
    Bearish,
    Mixed,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmaStack {
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    pub trend: Option<EmaTrend>,
}

/// EMA 20/50/200 over closes plus the stack classification:
/// bullish when close > ema20 > ema50, bearish when close < ema20 < ema50,
/// mixed otherwise. ema200 participates only when the window is deep enough.
pub fn ema_stack(candles: &[Candle]) -> EmaStack {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema20 = ema(&closes, 20);
    let ema50 = ema(&closes, 50);
    let ema200 = ema(&closes, 200);

    let trend = match (closes.last(), ema20, ema50) {
        (Some(&close), Some(e20), Some(e50)) => {
            let bullish = close > e20 && e20 > e50 && ema200.map_or(true, |e200| e50 > e200);
            let bearish = close < e20 && e20 < e50 && ema200.map_or(true, |e200| e50 < e200);
            Some(if bullish {
                EmaTrend::Bullish
            } else if bearish {
                EmaTrend::Bearish
            } else {
                EmaTrend::Mixed
            })
        }
        _ => None,
    };

    EmaStack {
        ema20,
        ema50,
        ema200,
        trend,
    }
}
