// =============================================================================
// Candle quality gate
// =============================================================================
//
// Validates a candle tail before analysis: OHLC logic, finite numbers,
// non-negative volume, and (optionally) time gaps. Invalid bars are dropped
// from the filtered view; the quality score is the valid ratio minus a
// small penalty per issue.
// =============================================================================

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Bars needed before a series is considered analyzable.
const MIN_VALID_BARS: usize = 30;
/// Valid-ratio floor for the `valid` verdict.
const MIN_VALID_RATIO: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct QualityReport {
    /// All critical checks passed: enough bars and almost all valid.
    pub valid: bool,
    /// The input with invalid bars removed.
    pub filtered: Vec<Candle>,
    /// Up to 20 human-readable findings.
    pub issues: Vec<String>,
    /// 0..1, 1 = pristine.
    pub quality_score: f64,
    pub invalid_count: usize,
    pub total_count: usize,
}

impl QualityReport {
    pub fn empty() -> Self {
        Self {
            valid: false,
            filtered: Vec::new(),
            issues: Vec::new(),
            quality_score: 0.0,
            invalid_count: 0,
            total_count: 0,
        }
    }
}

pub fn validate_candles(
    candles: &[Candle],
    timeframe: Option<Timeframe>,
    check_gaps: bool,
) -> QualityReport {
    let mut issues: Vec<String> = Vec::new();
    let mut filtered: Vec<Candle> = Vec::new();
    let mut invalid_count = 0usize;

    for (i, c) in candles.iter().enumerate() {
        let vals = [c.open, c.high, c.low, c.close, c.volume];
        if vals.iter().any(|v| v.is_nan()) {
            invalid_count += 1;
            issues.push(format!("bar {i}: NaN in OHLCV"));
            continue;
        }
        if vals.iter().any(|v| !v.is_finite()) {
            invalid_count += 1;
            issues.push(format!("bar {i}: non-finite OHLCV"));
            continue;
        }
        if c.volume < 0.0 {
            invalid_count += 1;
            issues.push(format!("bar {i}: negative volume"));
            continue;
        }
        if c.low > c.high {
            invalid_count += 1;
            issues.push(format!("bar {i}: low > high"));
            continue;
        }
        if c.open < c.low || c.open > c.high || c.close < c.low || c.close > c.high {
            invalid_count += 1;
            issues.push(format!("bar {i}: open/close outside [low, high]"));
            continue;
        }
        filtered.push(c.clone());
    }

    let total = candles.len();
    let (quality_score, valid) = if total == 0 {
        (0.0, false)
    } else {
        let ratio_ok = filtered.len() as f64 / total as f64;
        let issue_penalty = (issues.len() as f64 * 0.02).min(0.3);
        let score = (ratio_ok - issue_penalty).clamp(0.0, 1.0);
        (
            score,
            filtered.len() >= MIN_VALID_BARS && ratio_ok >= MIN_VALID_RATIO,
        )
    };

    // Time-gap check over the last 50 bars; a single finding is enough.
    if check_gaps && filtered.len() >= 2 {
        if let Some(interval_ms) = timeframe.and_then(|tf| tf.duration_ms()) {
            let tail = &filtered[filtered.len().saturating_sub(50)..];
            for w in tail.windows(2) {
                let gap = w[1].start_time - w[0].start_time;
                if gap as f64 > interval_ms as f64 * 1.5 {
                    issues.push(format!(
                        "time gap between bars: {gap} ms (expected ~{interval_ms})"
                    ));
                    break;
                }
            }
        }
    }

    issues.truncate(20);
    QualityReport {
        valid,
        filtered,
        issues,
        quality_score,
        invalid_count,
        total_count: total,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(start_time: i64) -> Candle {
        Candle::new(start_time, 100.0, 105.0, 95.0, 102.0, 10.0)
    }

    #[test]
    fn clean_series_is_valid() {
        let candles: Vec<Candle> = (0..50).map(|i| candle(i * 60_000)).collect();
        let report = validate_candles(&candles, Some(Timeframe::M1), false);
        assert!(report.valid);
        assert_eq!(report.filtered.len(), 50);
        assert!((report.quality_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_bars_are_dropped_and_scored() {
        let mut candles: Vec<Candle> = (0..50).map(|i| candle(i * 60_000)).collect();
        candles[3].low = 200.0; // low > high
        candles[7].close = f64::NAN;
        let report = validate_candles(&candles, None, false);
        assert_eq!(report.invalid_count, 2);
        assert_eq!(report.filtered.len(), 48);
        assert!(report.quality_score < 1.0);
        assert!(report.valid); // 48/50 = 0.96 >= 0.95
    }

    #[test]
    fn too_few_bars_is_invalid() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i * 60_000)).collect();
        let report = validate_candles(&candles, None, false);
        assert!(!report.valid);
    }

    #[test]
    fn gap_check_reports_missing_bars() {
        let mut candles: Vec<Candle> = (0..30).map(|i| candle(i * 60_000)).collect();
        candles.extend((40..60).map(|i| candle(i * 60_000))); // 10-bar hole
        let report = validate_candles(&candles, Some(Timeframe::M1), true);
        assert!(report.issues.iter().any(|s| s.contains("time gap")));
    }

    #[test]
    fn empty_input() {
        let report = validate_candles(&[], None, false);
        assert!(!report.valid);
        assert_eq!(report.quality_score, 0.0);
    }
}
