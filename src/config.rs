// =============================================================================
// Configuration — flat .env key-value file loaded once at startup
// =============================================================================
//
// Every tunable lives on the immutable `Config` struct. `Config::from_env()`
// reads the process environment (after `dotenv::dotenv()` in main) and falls
// back to the defaults baked in here. Nothing re-reads the environment
// mid-tick; validation failures at startup are fatal (exit code 1).
// =============================================================================

use std::path::PathBuf;

use crate::types::Timeframe;

/// Cumulative take-profit ladder entry: close up to `cumulative_share` of
/// the initial size once profit reaches `level_pct` percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpLevel {
    pub level_pct: f64,
    pub cumulative_share: f64,
}

/// Which phase classifier drives the multi-TF report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMethod {
    Wyckoff,
    Indicators,
    Structure,
}

#[derive(Debug, Clone)]
pub struct Config {
    // --- Venue -----------------------------------------------------------
    pub symbol: String,
    pub category: String,
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,

    // --- Timeframes & polling -------------------------------------------
    /// Timeframes fed to the multi-TF analyzer (ascending by duration).
    pub timeframes_analysis: Vec<Timeframe>,
    /// Timeframes maintained in the candle archive.
    pub timeframes_db: Vec<Timeframe>,
    pub kline_limit: usize,
    pub poll_interval_secs: f64,
    pub db_update_interval_secs: f64,
    pub backfill_max_candles: usize,
    pub orderbook_limit: usize,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub history_data_dir: PathBuf,

    // --- Venue retries ---------------------------------------------------
    pub exchange_max_retries: u32,
    pub retry_backoff_secs: f64,
    pub request_timeout_secs: u64,

    // --- Phase thresholds ------------------------------------------------
    pub phase_method: PhaseMethod,
    pub phase_score_min: f64,
    pub phase_min_gap: f64,
    pub phase_stability_min: f64,
    pub phase_history_size: usize,

    // --- Trend thresholds ------------------------------------------------
    pub trend_strength_min: f64,
    pub trend_unclear_threshold: f64,
    pub trend_min_gap: f64,
    /// Stricter gap for the down direction; 0 disables the override.
    pub trend_min_gap_down: f64,
    /// Multiplier applied to both scores in a surge regime; 0 disables.
    pub trend_surge_penalty: f64,
    pub trend_low_volume_threshold: f64,
    /// Multiplier applied when volume ratio is below the threshold; 0 off.
    pub trend_low_volume_penalty: f64,
    pub trend_stability_min: f64,

    // --- Entry filters ---------------------------------------------------
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
    /// Max levels returned by the trading-zone model; 0 = unlimited.
    pub trading_zones_max_levels: usize,

    // --- Order flow ------------------------------------------------------
    pub orderflow_enabled: bool,
    pub orderflow_window_secs: f64,
    pub orderflow_short_window_secs: f64,
    pub orderflow_ws_ping_interval_secs: u64,
    pub orderflow_ws_ping_timeout_secs: u64,
    pub orderflow_save_to_db: bool,
    pub trades_buffer_capacity: usize,
    pub microstructure_min_score: f64,

    // --- Sandbox ---------------------------------------------------------
    pub sandbox_enabled: bool,
    pub sandbox_initial_balance: f64,
    pub sandbox_taker_fee: f64,
    pub sandbox_min_confidence_to_open: f64,
    pub sandbox_cooldown_secs: i64,
    pub sandbox_min_hold_secs: i64,
    pub sandbox_exit_none_ticks: u32,
    pub sandbox_exit_min_confidence: f64,
    pub sandbox_min_confirming_ticks: u32,
    pub sandbox_exit_window_ticks: usize,
    pub sandbox_exit_window_need: usize,
    pub sandbox_stop_loss_pct: f64,
    pub sandbox_breakeven_trigger_pct: f64,
    pub sandbox_take_profit_pct: f64,
    pub sandbox_tp_levels: Vec<TpLevel>,
    pub sandbox_trail_trigger_pct: f64,
    pub sandbox_trail_pct: f64,
    pub sandbox_trend_filter: bool,
    pub sandbox_leverage_min: f64,
    pub sandbox_leverage_max: f64,
    pub sandbox_adaptive_leverage: bool,
    pub sandbox_margin_fraction: f64,
    pub sandbox_liquidation_maintenance: f64,
    pub sandbox_drawdown_leverage_threshold_pct: f64,
    pub sandbox_min_profit_pct: f64,
    pub sandbox_no_open_same_tick_as_close: bool,
    pub sandbox_no_open_sweep_only: bool,
    pub sandbox_sweep_delay_secs: i64,
    pub sandbox_use_context_now_primary: bool,
    pub sandbox_use_context_now_only: bool,
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_timeframes(key: &str, default: &str) -> Vec<Timeframe> {
    let raw = env_str(key, default);
    raw.split(',')
        .filter_map(|s| Timeframe::parse(s))
        .collect()
}

/// Parse a TP ladder string like `0.5:0.5,1.0:1.0` (level_pct:cumulative_share).
fn parse_tp_levels(raw: &str) -> Vec<TpLevel> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut it = part.splitn(2, ':');
        let (Some(pct), Some(share)) = (it.next(), it.next()) else {
            continue;
        };
        let (Ok(level_pct), Ok(cumulative_share)) =
            (pct.trim().parse::<f64>(), share.trim().parse::<f64>())
        else {
            continue;
        };
        if level_pct > 0.0 && cumulative_share > 0.0 && cumulative_share <= 1.0 {
            out.push(TpLevel {
                level_pct,
                cumulative_share,
            });
        }
    }
    out.sort_by(|a, b| a.level_pct.total_cmp(&b.level_pct));
    out
}

impl Config {
    /// Build the configuration from the process environment. Call
    /// `dotenv::dotenv()` first so a `.env` file is honored.
    pub fn from_env() -> Self {
        let db_path = env_str("DB_PATH", "data/klines.db");
        let log_dir = env_str("LOG_DIR", "logs");
        let history_dir = env_str("HISTORY_DATA_DIR", "data/history");
        let phase_method = match env_str("PHASE_METHOD", "wyckoff").to_lowercase().as_str() {
            "indicators" => PhaseMethod::Indicators,
            "structure" => PhaseMethod::Structure,
            _ => PhaseMethod::Wyckoff,
        };

        let leverage_min: f64 = env_parse("SANDBOX_LEVERAGE_MIN", 1.0_f64).max(1.0);
        let leverage_max: f64 = env_parse("SANDBOX_LEVERAGE_MAX", 5.0_f64).max(leverage_min);

        Self {
            symbol: env_str("SYMBOL", "BTCUSDT").to_uppercase(),
            category: env_str("BYBIT_CATEGORY", "linear"),
            testnet: env_bool("BYBIT_TESTNET", true),
            api_key: env_str("BYBIT_API_KEY", ""),
            api_secret: env_str("BYBIT_API_SECRET", ""),

            timeframes_analysis: env_timeframes("TIMEFRAMES", "15,60,240"),
            timeframes_db: env_timeframes(
                "TIMEFRAMES_DB",
                "1,3,5,15,30,60,120,240,360,720,D,W,M",
            ),
            kline_limit: env_parse("KLINE_LIMIT", 200_usize),
            poll_interval_secs: env_parse("POLL_INTERVAL_SEC", 60.0_f64),
            db_update_interval_secs: env_parse("DB_UPDATE_INTERVAL_SEC", 60.0_f64),
            backfill_max_candles: env_parse("BACKFILL_MAX_CANDLES", 50_000_usize),
            orderbook_limit: env_parse("ORDERBOOK_LIMIT", 25_usize),
            db_path: PathBuf::from(db_path),
            log_dir: PathBuf::from(log_dir),
            history_data_dir: PathBuf::from(history_dir),

            exchange_max_retries: env_parse("EXCHANGE_MAX_RETRIES", 5_u32),
            retry_backoff_secs: env_parse("EXCHANGE_RETRY_BACKOFF_SEC", 1.0_f64),
            request_timeout_secs: env_parse("EXCHANGE_REQUEST_TIMEOUT_SEC", 30_u64),

            phase_method,
            phase_score_min: env_parse("PHASE_SCORE_MIN", 0.6_f64),
            phase_min_gap: env_parse("PHASE_MIN_GAP", 0.1_f64),
            phase_stability_min: env_parse("PHASE_STABILITY_MIN", 0.6_f64),
            phase_history_size: env_parse("PHASE_HISTORY_SIZE", 5_usize),

            trend_strength_min: env_parse("TREND_STRENGTH_MIN", 0.35_f64),
            trend_unclear_threshold: env_parse("TREND_UNCLEAR_THRESHOLD", 0.3_f64),
            trend_min_gap: env_parse("TREND_MIN_GAP", 0.08_f64),
            trend_min_gap_down: env_parse("TREND_MIN_GAP_DOWN", 0.0_f64),
            trend_surge_penalty: env_parse("TREND_SURGE_PENALTY", 0.0_f64),
            trend_low_volume_threshold: env_parse("TREND_LOW_VOLUME_THRESHOLD", 0.7_f64),
            trend_low_volume_penalty: env_parse("TREND_LOW_VOLUME_PENALTY", 0.0_f64),
            trend_stability_min: env_parse("TREND_STABILITY_MIN", 0.0_f64),

            volume_min_ratio: env_parse("VOLUME_MIN_RATIO", 0.0_f64),
            atr_max_ratio: env_parse("ATR_MAX_RATIO", 0.0_f64),
            level_max_distance_pct: env_parse("LEVEL_MAX_DISTANCE_PCT", 0.0_f64),
            tf_align_min: env_parse("TF_ALIGN_MIN", 1_usize),
            candle_quality_min_score: env_parse("CANDLE_QUALITY_MIN_SCORE", 0.0_f64),
            regime_block_surge: env_bool("REGIME_BLOCK_SURGE", true),
            entry_weight_phase: env_parse("ENTRY_SCORE_WEIGHT_PHASE", 0.4_f64),
            entry_weight_trend: env_parse("ENTRY_SCORE_WEIGHT_TREND", 0.35_f64),
            entry_weight_tf_align: env_parse("ENTRY_SCORE_WEIGHT_TF_ALIGN", 0.25_f64),
            signal_min_confidence: env_parse("SIGNAL_MIN_CONFIDENCE", 0.0_f64),
            trading_zones_max_levels: env_parse("TRADING_ZONES_MAX_LEVELS", 0_usize),

            orderflow_enabled: env_bool("ORDERFLOW_ENABLED", false),
            orderflow_window_secs: env_parse("ORDERFLOW_WINDOW_SEC", 60.0_f64),
            orderflow_short_window_secs: env_parse("ORDERFLOW_SHORT_WINDOW_SEC", 20.0_f64),
            orderflow_ws_ping_interval_secs: env_parse("ORDERFLOW_WS_PING_INTERVAL", 30_u64),
            orderflow_ws_ping_timeout_secs: env_parse("ORDERFLOW_WS_PING_TIMEOUT", 20_u64),
            orderflow_save_to_db: env_bool("ORDERFLOW_SAVE_TO_DB", false),
            trades_buffer_capacity: env_parse("TRADES_BUFFER_CAPACITY", 50_000_usize),
            microstructure_min_score: env_parse("MICROSTRUCTURE_MIN_SCORE", 0.25_f64),

            sandbox_enabled: env_bool("MICROSTRUCTURE_SANDBOX_ENABLED", false),
            sandbox_initial_balance: env_parse("SANDBOX_INITIAL_BALANCE", 100.0_f64),
            sandbox_taker_fee: env_parse("SANDBOX_TAKER_FEE", 0.0006_f64).max(0.0),
            sandbox_min_confidence_to_open: env_parse("SANDBOX_MIN_CONFIDENCE_TO_OPEN", 0.0_f64),
            sandbox_cooldown_secs: env_parse("SANDBOX_COOLDOWN_SEC", 0_i64).max(0),
            sandbox_min_hold_secs: env_parse("SANDBOX_MIN_HOLD_SEC", 0_i64).max(0),
            sandbox_exit_none_ticks: env_parse("SANDBOX_EXIT_NONE_TICKS", 1_u32).max(1),
            sandbox_exit_min_confidence: env_parse("SANDBOX_EXIT_MIN_CONFIDENCE", 0.0_f64)
                .max(0.0),
            sandbox_min_confirming_ticks: env_parse("SANDBOX_MIN_CONFIRMING_TICKS", 0_u32),
            sandbox_exit_window_ticks: env_parse("SANDBOX_EXIT_WINDOW_TICKS", 0_usize),
            sandbox_exit_window_need: env_parse("SANDBOX_EXIT_WINDOW_NEED", 0_usize),
            sandbox_stop_loss_pct: env_parse("SANDBOX_STOP_LOSS_PCT", 0.0_f64).max(0.0),
            sandbox_breakeven_trigger_pct: env_parse("SANDBOX_BREAKEVEN_TRIGGER_PCT", 0.0_f64)
                .max(0.0),
            sandbox_take_profit_pct: env_parse("SANDBOX_TAKE_PROFIT_PCT", 0.0_f64).max(0.0),
            sandbox_tp_levels: parse_tp_levels(&env_str("SANDBOX_TP_LEVELS", "")),
            sandbox_trail_trigger_pct: env_parse("SANDBOX_TRAIL_TRIGGER_PCT", 0.0_f64).max(0.0),
            sandbox_trail_pct: env_parse("SANDBOX_TRAIL_PCT", 0.0_f64).max(0.0),
            sandbox_trend_filter: env_bool("SANDBOX_TREND_FILTER", false),
            sandbox_leverage_min: leverage_min,
            sandbox_leverage_max: leverage_max,
            sandbox_adaptive_leverage: env_bool("SANDBOX_ADAPTIVE_LEVERAGE", true),
            sandbox_margin_fraction: env_parse("SANDBOX_MARGIN_FRACTION", 0.95_f64)
                .clamp(0.01, 1.0),
            sandbox_liquidation_maintenance: env_parse("SANDBOX_LIQUIDATION_MAINTENANCE", 1.0_f64)
                .max(0.0),
            sandbox_drawdown_leverage_threshold_pct: env_parse(
                "SANDBOX_DRAWDOWN_LEVERAGE_PCT",
                10.0_f64,
            )
            .max(0.0),
            sandbox_min_profit_pct: env_parse("SANDBOX_MIN_PROFIT_PCT", 0.0_f64).max(0.0),
            sandbox_no_open_same_tick_as_close: env_bool("SANDBOX_NO_OPEN_SAME_TICK_AS_CLOSE", true),
            sandbox_no_open_sweep_only: env_bool("SANDBOX_NO_OPEN_SWEEP_ONLY", true),
            sandbox_sweep_delay_secs: env_parse("SANDBOX_SWEEP_DELAY_SEC", 0_i64).max(0),
            sandbox_use_context_now_primary: env_bool("SANDBOX_USE_CONTEXT_NOW_PRIMARY", false),
            sandbox_use_context_now_only: env_bool("SANDBOX_USE_CONTEXT_NOW_ONLY", false),
        }
    }

    /// Validate the configuration. Returns every problem found; a non-empty
    /// list is fatal at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.symbol.is_empty() {
            errors.push("SYMBOL must not be empty".to_string());
        }
        if self.timeframes_analysis.is_empty() {
            errors.push("TIMEFRAMES must contain at least one interval (e.g. 15,60,240)".into());
        }
        if self.timeframes_db.is_empty() {
            errors.push("TIMEFRAMES_DB must contain at least one interval".into());
        }
        if self.kline_limit == 0 {
            errors.push("KLINE_LIMIT must be positive".into());
        }
        if self.poll_interval_secs <= 0.0 {
            errors.push("POLL_INTERVAL_SEC must be positive".into());
        }
        if !(self.sandbox_initial_balance > 0.0) {
            errors.push("SANDBOX_INITIAL_BALANCE must be positive".into());
        }
        let mut prev_share = 0.0;
        for lvl in &self.sandbox_tp_levels {
            if lvl.cumulative_share < prev_share {
                errors.push("SANDBOX_TP_LEVELS cumulative shares must be non-decreasing".into());
                break;
            }
            prev_share = lvl.cumulative_share;
        }
        errors
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_levels_parse_and_sort() {
        let levels = parse_tp_levels("1.0:1.0, 0.5:0.5");
        assert_eq!(levels.len(), 2);
        assert!((levels[0].level_pct - 0.5).abs() < 1e-12);
        assert!((levels[1].cumulative_share - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tp_levels_reject_garbage() {
        assert!(parse_tp_levels("").is_empty());
        assert!(parse_tp_levels("abc").is_empty());
        assert!(parse_tp_levels("0.5:1.5").is_empty()); // share above 1
        assert!(parse_tp_levels("-1:0.5").is_empty()); // negative level
    }

    #[test]
    fn validate_flags_empty_timeframes() {
        let mut cfg = Config::from_env();
        cfg.timeframes_analysis.clear();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("TIMEFRAMES")));
    }

    #[test]
    fn validate_flags_nondecreasing_tp_shares() {
        let mut cfg = Config::from_env();
        cfg.sandbox_tp_levels = vec![
            TpLevel {
                level_pct: 0.5,
                cumulative_share: 0.8,
            },
            TpLevel {
                level_pct: 1.0,
                cumulative_share: 0.5,
            },
        ];
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("TP_LEVELS")));
    }
}
