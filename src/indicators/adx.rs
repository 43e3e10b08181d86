// =============================================================================
// Average Directional Index with +DI / -DI (Wilder)
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar transition.
//   2. Wilder's smoothing of all three over `period`.
//   3. +DI / -DI from the smoothed values, DX per bar.
//   4. ADX = Wilder-smoothed DX, seeded with the SMA of the first `period`
//      DX values.
//
// Needs at least `2 * period + 1` candles to produce one reading.
// =============================================================================

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy)]
pub struct AdxReading {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Compute ADX and the directional indicators over the candle window.
pub fn adx(candles: &[Candle], period: usize) -> Option<AdxReading> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let period_f = period as f64;
    let transitions = candles.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    let mut last_di = di_pair(smooth_plus, smooth_minus, smooth_tr)?;
    dx_values.push(dx_from(last_di));

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        last_di = di_pair(smooth_plus, smooth_minus, smooth_tr)?;
        dx_values.push(dx_from(last_di));
    }

    if dx_values.len() < period {
        return None;
    }
    let mut adx_val: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx_val = (adx_val * (period_f - 1.0) + dx) / period_f;
    }
    if !adx_val.is_finite() {
        return None;
    }

    Some(AdxReading {
        adx: adx_val,
        plus_di: last_di.0,
        minus_di: last_di.1,
    })
}

fn di_pair(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<(f64, f64)> {
    if smooth_tr <= 0.0 || !smooth_tr.is_finite() {
        return None;
    }
    let plus = smooth_plus / smooth_tr * 100.0;
    let minus = smooth_minus / smooth_tr * 100.0;
    if plus.is_finite() && minus.is_finite() {
        Some((plus, minus))
    } else {
        None
    }
}

fn dx_from((plus, minus): (f64, f64)) -> f64 {
    let sum = plus + minus;
    if sum <= 0.0 {
        0.0
    } else {
        (plus - minus).abs() / sum * 100.0
    }
}
