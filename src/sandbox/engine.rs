// =============================================================================
// Sandbox engine — virtual position, adaptive leverage, ordered exits
// =============================================================================
//
// Driven once per control tick with the microstructure signal, the order
// flow bundle, the current price, and optional higher-TF / context gates.
//
// Equity model: margin = max(1% of initial balance, equity * fraction),
// notional = margin * leverage, taker fee debited on every open and close.
// Leverage adapts to signal confidence and is capped at the midpoint when
// drawdown from peak equity exceeds the configured threshold.
//
// Exits are an ordered list — liquidation, price exits (breakeven-armed
// stop, fixed TP, trailing), partial TP ladder, microstructure exit — and
// at most one rule fires per tick. Entry gates run in a fixed order and the
// first failing gate records a Skip row.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::{info, warn};

use crate::analysis::context_now::ContextNow;
use crate::analysis::microstructure::MicrostructureSignal;
use crate::analysis::orderflow::OrderflowReport;
use crate::config::{Config, TpLevel};
use crate::store::{PaperStore, SkipRow, TradeRow};
use crate::types::{EntryType, ExitReason, PositionSide, SignalDirection, TradeAction, TrendDirection};

use super::sink::TradeLog;
use super::state::SandboxState;

/// Hot-level proximity that blocks entries into the level (0.2%).
const HOT_LEVEL_DISTANCE_PCT: f64 = 0.002;
/// Cumulative TP share at which the residual position is considered closed.
const TP_FULL_CLOSE_EPS: f64 = 0.9999;

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub initial_balance: f64,
    pub min_confidence_to_open: f64,
    pub taker_fee: f64,
    pub cooldown_secs: i64,
    pub min_hold_secs: i64,
    pub exit_none_ticks: u32,
    pub exit_min_confidence: f64,
    pub min_confirming_ticks: u32,
    pub exit_window_ticks: usize,
    pub exit_window_need: usize,
    pub stop_loss_pct: f64,
    pub breakeven_trigger_pct: f64,
    pub take_profit_pct: f64,
    pub tp_levels: Vec<TpLevel>,
    pub trail_trigger_pct: f64,
    pub trail_pct: f64,
    pub trend_filter: bool,
    pub leverage_min: f64,
    pub leverage_max: f64,
    pub adaptive_leverage: bool,
    pub margin_fraction: f64,
    pub liquidation_maintenance: f64,
    pub drawdown_leverage_threshold_pct: f64,
    pub min_profit_pct: f64,
    pub no_open_same_tick_as_close: bool,
    pub no_open_sweep_only: bool,
    pub sweep_delay_secs: i64,
    pub use_context_now_primary: bool,
    pub use_context_now_only: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            initial_balance: 100.0,
            min_confidence_to_open: 0.0,
            taker_fee: 0.0006,
            cooldown_secs: 0,
            min_hold_secs: 0,
            exit_none_ticks: 1,
            exit_min_confidence: 0.0,
            min_confirming_ticks: 0,
            exit_window_ticks: 0,
            exit_window_need: 0,
            stop_loss_pct: 0.0,
            breakeven_trigger_pct: 0.0,
            take_profit_pct: 0.0,
            tp_levels: Vec::new(),
            trail_trigger_pct: 0.0,
            trail_pct: 0.0,
            trend_filter: false,
            leverage_min: 1.0,
            leverage_max: 5.0,
            adaptive_leverage: true,
            margin_fraction: 0.95,
            liquidation_maintenance: 1.0,
            drawdown_leverage_threshold_pct: 10.0,
            min_profit_pct: 0.0,
            no_open_same_tick_as_close: true,
            no_open_sweep_only: true,
            sweep_delay_secs: 0,
            use_context_now_primary: false,
            use_context_now_only: false,
        }
    }
}

impl SandboxSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            initial_balance: cfg.sandbox_initial_balance,
            min_confidence_to_open: cfg.sandbox_min_confidence_to_open,
            taker_fee: cfg.sandbox_taker_fee,
            cooldown_secs: cfg.sandbox_cooldown_secs,
            min_hold_secs: cfg.sandbox_min_hold_secs,
            exit_none_ticks: cfg.sandbox_exit_none_ticks,
            exit_min_confidence: cfg.sandbox_exit_min_confidence,
            min_confirming_ticks: cfg.sandbox_min_confirming_ticks,
            exit_window_ticks: cfg.sandbox_exit_window_ticks,
            exit_window_need: cfg.sandbox_exit_window_need,
            stop_loss_pct: cfg.sandbox_stop_loss_pct,
            breakeven_trigger_pct: cfg.sandbox_breakeven_trigger_pct,
            take_profit_pct: cfg.sandbox_take_profit_pct,
            tp_levels: cfg.sandbox_tp_levels.clone(),
            trail_trigger_pct: cfg.sandbox_trail_trigger_pct,
            trail_pct: cfg.sandbox_trail_pct,
            trend_filter: cfg.sandbox_trend_filter,
            leverage_min: cfg.sandbox_leverage_min,
            leverage_max: cfg.sandbox_leverage_max,
            adaptive_leverage: cfg.sandbox_adaptive_leverage,
            margin_fraction: cfg.sandbox_margin_fraction,
            liquidation_maintenance: cfg.sandbox_liquidation_maintenance,
            drawdown_leverage_threshold_pct: cfg.sandbox_drawdown_leverage_threshold_pct,
            min_profit_pct: cfg.sandbox_min_profit_pct,
            no_open_same_tick_as_close: cfg.sandbox_no_open_same_tick_as_close,
            no_open_sweep_only: cfg.sandbox_no_open_sweep_only,
            sweep_delay_secs: cfg.sandbox_sweep_delay_secs,
            use_context_now_primary: cfg.sandbox_use_context_now_primary,
            use_context_now_only: cfg.sandbox_use_context_now_only,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSummary {
    pub trades_count: usize,
    pub opens_count: usize,
    pub closes_count: usize,
    pub total_commission: f64,
    pub total_realized_pnl_gross: f64,
    pub total_realized_pnl_net: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub equity: f64,
    pub exits_by: Vec<(String, usize)>,
}

pub struct Sandbox {
    settings: SandboxSettings,
    log: Option<TradeLog>,
    store: Option<(Arc<PaperStore>, String)>,

    side: PositionSide,
    entry_price: f64,
    entry_ts: i64,
    size: f64,
    initial_size: f64,
    margin_used: f64,
    current_leverage: f64,
    sl_at_breakeven: bool,
    /// Monotonic non-decreasing until the position closes.
    tp_closed_share: f64,
    trail_peak_pct: f64,
    exit_signal_ticks: u32,
    confirming_ticks: u32,
    exit_window: VecDeque<bool>,
    last_close_ts: i64,
    closed_this_tick: bool,
    peak_equity: f64,
    /// Gross (pre-commission) realized PnL.
    total_realized_pnl: f64,
    total_commission: f64,
    trades: Vec<TradeRow>,
    skips: Vec<SkipRow>,
    last_signal_direction: SignalDirection,
    last_signal_confidence: f64,
    last_signal_reason: String,
    last_ts: i64,
}

impl Sandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            log: None,
            store: None,
            side: PositionSide::Flat,
            entry_price: 0.0,
            entry_ts: 0,
            size: 0.0,
            initial_size: 0.0,
            margin_used: 0.0,
            current_leverage: 1.0,
            sl_at_breakeven: false,
            tp_closed_share: 0.0,
            trail_peak_pct: 0.0,
            exit_signal_ticks: 0,
            confirming_ticks: 0,
            exit_window: VecDeque::new(),
            last_close_ts: 0,
            closed_this_tick: false,
            peak_equity: 0.0,
            total_realized_pnl: 0.0,
            total_commission: 0.0,
            trades: Vec::new(),
            skips: Vec::new(),
            last_signal_direction: SignalDirection::None,
            last_signal_confidence: 0.0,
            last_signal_reason: String::new(),
            last_ts: 0,
        }
    }

    /// Attach the CSV sink.
    pub fn with_log(mut self, log: TradeLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Attach the durable archive; rows carry this run id.
    pub fn with_store(mut self, store: Arc<PaperStore>, run_id: String) -> Self {
        self.store = Some((store, run_id));
        self
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Flat => 0.0,
            PositionSide::Long => (current_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - current_price) * self.size,
        }
    }

    /// equity = initial balance + realized gross - commissions + unrealized.
    pub fn equity(&self, current_price: f64) -> f64 {
        self.settings.initial_balance + self.total_realized_pnl - self.total_commission
            + self.unrealized_pnl(current_price)
    }

    pub fn position_side(&self) -> PositionSide {
        self.side
    }

    pub fn trades(&self) -> &[TradeRow] {
        &self.trades
    }

    pub fn skips(&self) -> &[SkipRow] {
        &self.skips
    }

    /// Signed profit percentage of the open position at `price`.
    fn profit_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = match self.side {
            PositionSide::Long => (price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - price) / self.entry_price,
            PositionSide::Flat => 0.0,
        };
        raw * 100.0
    }

    fn compute_leverage(&mut self, confidence: f64, equity: f64) -> f64 {
        let s = &self.settings;
        if !s.adaptive_leverage || s.leverage_max <= s.leverage_min {
            return s.leverage_max;
        }
        self.peak_equity = self.peak_equity.max(equity);
        let drawdown_pct = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity * 100.0
        } else {
            0.0
        };
        let mut lev = s.leverage_min + (s.leverage_max - s.leverage_min) * confidence;
        if s.drawdown_leverage_threshold_pct > 0.0
            && drawdown_pct >= s.drawdown_leverage_threshold_pct
        {
            lev = lev.min(s.leverage_min + 0.5 * (s.leverage_max - s.leverage_min));
        }
        lev.clamp(s.leverage_min, s.leverage_max)
    }

    // -------------------------------------------------------------------------
    // Row plumbing
    // -------------------------------------------------------------------------

    fn ts_utc(ts_sec: i64) -> String {
        Utc.timestamp_opt(ts_sec, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    fn record_trade(
        &mut self,
        ts_sec: i64,
        action: TradeAction,
        side: PositionSide,
        price: f64,
        size: f64,
        notional: f64,
        commission: f64,
        realized_pnl: Option<f64>,
        reason: &str,
        leverage: f64,
        exit_reason: Option<ExitReason>,
        entry_type: Option<EntryType>,
    ) {
        let row = TradeRow {
            ts_utc: Self::ts_utc(ts_sec),
            ts_unix: ts_sec,
            action: action.as_str().to_string(),
            side: side.to_string(),
            price,
            size,
            notional_usd: notional,
            commission_usd: commission,
            realized_pnl_usd: realized_pnl,
            signal_direction: self.last_signal_direction.as_str().to_string(),
            signal_confidence: self.last_signal_confidence,
            reason: reason.chars().take(200).collect(),
            leverage,
            exit_reason: exit_reason.map(|r| r.as_str().to_string()).unwrap_or_default(),
            entry_type: entry_type.map(|t| t.as_str().to_string()).unwrap_or_default(),
        };
        if let Some(log) = &self.log {
            if let Err(e) = log.append_trade(&row) {
                warn!(error = %e, "failed to append trade to CSV sink");
            }
        }
        if let Some((store, run_id)) = &self.store {
            if let Err(e) = store.insert_trade(run_id, &row) {
                warn!(error = %e, "failed to persist trade row");
            }
        }
        match action {
            TradeAction::Open => info!(
                side = %side,
                price,
                confidence = self.last_signal_confidence,
                leverage,
                notional,
                "sandbox open"
            ),
            TradeAction::Close => info!(
                side = %side,
                price,
                realized = realized_pnl.unwrap_or(0.0),
                exit = %row.exit_reason,
                "sandbox close"
            ),
        }
        self.trades.push(row);
    }

    fn record_skip(&mut self, ts_sec: i64, direction: SignalDirection, confidence: f64, reason: &str) {
        let row = SkipRow {
            ts_utc: Self::ts_utc(ts_sec),
            ts_unix: ts_sec,
            direction: direction.as_str().to_string(),
            confidence,
            skip_reason: reason.to_string(),
        };
        if let Some(log) = &self.log {
            if let Err(e) = log.append_skip(&row) {
                warn!(error = %e, "failed to append skip to CSV sink");
            }
        }
        if let Some((store, run_id)) = &self.store {
            if let Err(e) = store.insert_skip(run_id, &row) {
                warn!(error = %e, "failed to persist skip row");
            }
        }
        self.skips.push(row);
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    fn reset_position(&mut self, ts_sec: i64) {
        self.last_close_ts = ts_sec;
        self.exit_signal_ticks = 0;
        self.exit_window.clear();
        self.closed_this_tick = true;
        self.side = PositionSide::Flat;
        self.entry_price = 0.0;
        self.size = 0.0;
        self.entry_ts = 0;
        self.initial_size = 0.0;
        self.tp_closed_share = 0.0;
        self.sl_at_breakeven = false;
        self.trail_peak_pct = 0.0;
        self.margin_used = 0.0;
        self.current_leverage = 1.0;
    }

    fn close_full(&mut self, price: f64, ts_sec: i64, reason: &str, exit_reason: ExitReason) {
        let realized = self.unrealized_pnl(price);
        let notional = self.size * price;
        let commission = notional * self.settings.taker_fee;
        self.total_commission += commission;
        self.total_realized_pnl += realized;
        let side = self.side;
        let size = self.size;
        let leverage = self.current_leverage;
        self.record_trade(
            ts_sec,
            TradeAction::Close,
            side,
            price,
            size,
            notional,
            commission,
            Some(realized),
            reason,
            leverage,
            Some(exit_reason),
            None,
        );
        self.reset_position(ts_sec);
    }

    /// Close `share` of the initial size at a TP rung. Fully closes when
    /// the residual share drops to zero.
    fn close_partial(&mut self, share: f64, price: f64, ts_sec: i64, current_pct: f64) {
        if self.initial_size <= 0.0 || share <= 0.0 || self.size <= 0.0 {
            return;
        }
        let close_size = (self.initial_size * share).min(self.size);
        if close_size <= 0.0 {
            return;
        }
        let realized = match self.side {
            PositionSide::Long => close_size * (price - self.entry_price),
            PositionSide::Short => close_size * (self.entry_price - price),
            PositionSide::Flat => return,
        };
        let notional = close_size * price;
        let commission = notional * self.settings.taker_fee;
        self.total_commission += commission;
        self.total_realized_pnl += realized;
        self.size -= close_size;
        self.tp_closed_share += close_size / self.initial_size;
        let side = self.side;
        let leverage = self.current_leverage;
        let reason = format!(
            "take_profit_part {current_pct:.2}% ({}%)",
            (share * 100.0).round() as i64
        );
        self.record_trade(
            ts_sec,
            TradeAction::Close,
            side,
            price,
            close_size,
            notional,
            commission,
            Some(realized),
            &reason,
            leverage,
            Some(ExitReason::TakeProfitPart),
            None,
        );
        if self.size <= 0.0 || self.tp_closed_share >= TP_FULL_CLOSE_EPS {
            self.reset_position(ts_sec);
        }
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    fn open_position(
        &mut self,
        target: PositionSide,
        price: f64,
        ts_sec: i64,
        confidence: f64,
        reason: &str,
        entry_type: EntryType,
    ) {
        if price <= 0.0 {
            return;
        }
        let equity = self.equity(price);
        let leverage = self.compute_leverage(confidence, equity);
        let margin = (self.settings.initial_balance * 0.01).max(equity * self.settings.margin_fraction);
        let notional = margin * leverage;
        self.side = target;
        self.entry_price = price;
        self.size = notional / price;
        self.entry_ts = ts_sec;
        self.margin_used = if leverage > 0.0 { notional / leverage } else { 0.0 };
        self.current_leverage = leverage;
        self.exit_signal_ticks = 0;
        self.confirming_ticks = 0;
        self.exit_window.clear();
        self.initial_size = self.size;
        self.tp_closed_share = 0.0;
        let commission = notional * self.settings.taker_fee;
        self.total_commission += commission;
        let size = self.size;
        self.record_trade(
            ts_sec,
            TradeAction::Open,
            target,
            price,
            size,
            notional,
            commission,
            None,
            reason,
            leverage,
            None,
            Some(entry_type),
        );
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// One sandbox step. Returns the published snapshot.
    pub fn update(
        &mut self,
        signal: &MicrostructureSignal,
        of: &OrderflowReport,
        current_price: f64,
        ts_sec: i64,
        higher_tf_trend: Option<TrendDirection>,
        context_now: Option<&ContextNow>,
    ) -> SandboxState {
        let s = self.settings.clone();

        // Resolve direction/confidence. Context-now-only mode replaces the
        // microstructure signal with the level+flow gate.
        let (mut direction, mut confidence, mut reason) =
            (signal.direction, signal.confidence, signal.reason.clone());
        if s.use_context_now_only {
            if let Some(ctx) = context_now {
                if ctx.allowed_long {
                    direction = SignalDirection::Long;
                    confidence = (ctx.short_window_delta_ratio.abs() * 2.0).clamp(0.5, 1.0);
                    reason = "context_now only: at_support + flow_bullish".into();
                } else if ctx.allowed_short {
                    direction = SignalDirection::Short;
                    confidence = (ctx.short_window_delta_ratio.abs() * 2.0).clamp(0.5, 1.0);
                    reason = "context_now only: at_resistance + flow_bearish".into();
                } else {
                    direction = SignalDirection::None;
                    confidence = 0.0;
                    reason = "context_now only: no level+flow".into();
                }
            }
        }
        self.last_signal_direction = direction;
        self.last_signal_confidence = confidence;
        self.last_signal_reason = reason.clone();
        self.last_ts = ts_sec;

        let equity = self.equity(current_price);
        self.peak_equity = self.peak_equity.max(equity);
        self.closed_this_tick = false;

        // Ticks "in our direction" since entry; never reset mid-position.
        if self.side != PositionSide::Flat {
            let dir_ok = (self.side == PositionSide::Long && direction == SignalDirection::Long)
                || (self.side == PositionSide::Short && direction == SignalDirection::Short);
            if dir_ok {
                self.confirming_ticks += 1;
            }
        }

        // Exit-wanted flag: signal gone/opposite, or confidence collapsed.
        let want_exit_dir = direction == SignalDirection::None
            || (direction == SignalDirection::Long && self.side == PositionSide::Short)
            || (direction == SignalDirection::Short && self.side == PositionSide::Long);
        let want_exit_conf = s.exit_min_confidence > 0.0 && confidence < s.exit_min_confidence;
        let want_exit = want_exit_dir || want_exit_conf;

        let mut exit_window_ok = true;
        if self.side != PositionSide::Flat {
            if want_exit {
                self.exit_signal_ticks += 1;
            } else {
                self.exit_signal_ticks = 0;
            }
            if s.exit_window_ticks > 0 && s.exit_window_need > 0 {
                self.exit_window.push_back(want_exit);
                while self.exit_window.len() > s.exit_window_ticks {
                    self.exit_window.pop_front();
                }
                exit_window_ok = self.exit_window.len() >= s.exit_window_ticks
                    && self.exit_window.iter().filter(|f| **f).count() >= s.exit_window_need;
            }
        }

        // Price-based exit evaluation (also arms breakeven / trailing).
        let mut pct_chg = 0.0;
        let mut price_exit: Option<(ExitReason, String)> = None;
        if self.side != PositionSide::Flat && self.entry_price > 0.0 {
            pct_chg = self.profit_pct(current_price);
            if s.breakeven_trigger_pct > 0.0
                && s.stop_loss_pct > 0.0
                && !self.sl_at_breakeven
                && pct_chg >= s.breakeven_trigger_pct
            {
                self.sl_at_breakeven = true;
            }
            if s.stop_loss_pct > 0.0 {
                if self.sl_at_breakeven {
                    if pct_chg <= 0.0 {
                        price_exit =
                            Some((ExitReason::Breakeven, format!("breakeven {pct_chg:.2}%")));
                    }
                } else if pct_chg <= -s.stop_loss_pct {
                    price_exit = Some((ExitReason::StopLoss, format!("stop_loss {pct_chg:.2}%")));
                }
            }
            if price_exit.is_none()
                && s.tp_levels.is_empty()
                && s.take_profit_pct > 0.0
                && pct_chg >= s.take_profit_pct
            {
                price_exit = Some((ExitReason::TakeProfit, format!("take_profit {pct_chg:.2}%")));
            }
            if price_exit.is_none()
                && s.trail_trigger_pct > 0.0
                && s.trail_pct > 0.0
                && pct_chg >= s.trail_trigger_pct
            {
                self.trail_peak_pct = self.trail_peak_pct.max(pct_chg);
                if self.trail_peak_pct > 0.0 && pct_chg <= self.trail_peak_pct - s.trail_pct {
                    price_exit = Some((
                        ExitReason::TrailingStop,
                        format!(
                            "trailing_stop {pct_chg:.2}% (peak {:.2}%)",
                            self.trail_peak_pct
                        ),
                    ));
                }
            }
        }

        // --- Exit rules, first hit wins ----------------------------------
        if self.side != PositionSide::Flat
            && self.margin_used > 0.0
            && s.liquidation_maintenance > 0.0
            && self.unrealized_pnl(current_price)
                <= -self.margin_used * s.liquidation_maintenance
        {
            self.close_full(current_price, ts_sec, "liquidation", ExitReason::Liquidation);
        } else if let Some((exit_reason, text)) = price_exit {
            // price_exit is only computed while a position is open.
            self.close_full(current_price, ts_sec, &text, exit_reason);
        } else if self.side != PositionSide::Flat
            && !s.tp_levels.is_empty()
            && pct_chg > 0.0
            && self.initial_size > 0.0
        {
            for level in s.tp_levels.clone() {
                if pct_chg >= level.level_pct && self.tp_closed_share < level.cumulative_share {
                    let share = level.cumulative_share - self.tp_closed_share;
                    self.close_partial(share, current_price, ts_sec, pct_chg);
                    if self.side == PositionSide::Flat {
                        break;
                    }
                }
            }
        } else if self.side != PositionSide::Flat && want_exit {
            let held_secs = ts_sec - self.entry_ts;
            let confirming_ok = s.min_confirming_ticks == 0
                || self.confirming_ticks >= s.min_confirming_ticks;
            let consecutive_ok = if s.exit_window_ticks > 0 && s.exit_window_need > 0 {
                exit_window_ok
            } else {
                self.exit_signal_ticks >= s.exit_none_ticks
            };
            // In profit, hold until the move at least covers commissions.
            let mut profit_guard_ok = true;
            if s.min_profit_pct > 0.0
                && self.entry_price > 0.0
                && self.unrealized_pnl(current_price) > 0.0
                && self.profit_pct(current_price) < s.min_profit_pct
            {
                profit_guard_ok = false;
            }
            if held_secs >= s.min_hold_secs && confirming_ok && consecutive_ok && profit_guard_ok {
                self.close_full(current_price, ts_sec, &reason, ExitReason::Microstructure);
            }
        }

        // --- Entry gates --------------------------------------------------
        if direction != SignalDirection::None {
            let target = if direction == SignalDirection::Long {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            if self.side != target {
                if let Some(skip_reason) =
                    self.first_failing_gate(direction, confidence, signal, of, current_price, ts_sec, higher_tf_trend, context_now)
                {
                    self.record_skip(ts_sec, direction, confidence, &skip_reason);
                } else {
                    // Reverse first when holding the opposite side.
                    if self.side != PositionSide::Flat {
                        let side_reason = reason.clone();
                        self.close_full(
                            current_price,
                            ts_sec,
                            &side_reason,
                            ExitReason::Microstructure,
                        );
                    }
                    // A supplied context reading labels the entry even when
                    // the primary gate is off.
                    let entry_type = if s.use_context_now_only {
                        EntryType::ContextNowOnly
                    } else if context_now.is_some() {
                        EntryType::ContextNowPrimary
                    } else {
                        EntryType::Microstructure
                    };
                    let open_reason = reason.clone();
                    self.open_position(target, current_price, ts_sec, confidence, &open_reason, entry_type);
                }
            }
        }

        self.snapshot(current_price)
    }

    /// Entry gates in their fixed order; returns the first failing gate's
    /// skip reason.
    #[allow(clippy::too_many_arguments)]
    fn first_failing_gate(
        &self,
        direction: SignalDirection,
        confidence: f64,
        signal: &MicrostructureSignal,
        of: &OrderflowReport,
        current_price: f64,
        ts_sec: i64,
        higher_tf_trend: Option<TrendDirection>,
        context_now: Option<&ContextNow>,
    ) -> Option<String> {
        let s = &self.settings;

        // 1. Cooldown after the previous close.
        if s.cooldown_secs > 0
            && self.last_close_ts > 0
            && (ts_sec - self.last_close_ts) < s.cooldown_secs
        {
            return Some("cooldown".into());
        }
        // 2. A close already fired this tick.
        if s.no_open_same_tick_as_close && self.closed_this_tick {
            return Some("same_tick_as_close".into());
        }
        // 3. Sweep is the only evidence.
        if s.no_open_sweep_only && signal.sweep_only {
            return Some("sweep_only".into());
        }
        // 4. Too soon after the last sweep.
        if s.sweep_delay_secs > 0 {
            if let Some(sweep_time) = of.sweeps.as_ref().and_then(|sw| sw.last_sweep_time) {
                let sweep_sec = if sweep_time > 1_000_000_000_000 {
                    sweep_time / 1000
                } else {
                    sweep_time
                };
                if ts_sec - sweep_sec < s.sweep_delay_secs {
                    return Some("sweep_delay".into());
                }
            }
        }
        // 5. Against the higher-TF trend.
        if s.trend_filter {
            match (direction, higher_tf_trend) {
                (SignalDirection::Long, Some(TrendDirection::Down))
                | (SignalDirection::Short, Some(TrendDirection::Up)) => {
                    return Some("trend_filter".into());
                }
                _ => {}
            }
        }
        // 6. Delta/price divergence against the entry.
        if let Some(div) = &of.delta_price_divergence {
            if direction == SignalDirection::Long && div.bearish {
                return Some("divergence".into());
            }
            if direction == SignalDirection::Short && div.bullish {
                return Some("divergence".into());
            }
        }
        // 7. Entering straight into a hot T&S level.
        if current_price > 0.0 {
            let hot = &of.trades_by_level.hot_levels;
            let near_hot_resistance = hot.iter().any(|lev| {
                lev.price > current_price
                    && (lev.price - current_price) / current_price <= HOT_LEVEL_DISTANCE_PCT
            });
            let near_hot_support = hot.iter().any(|lev| {
                lev.price < current_price
                    && (current_price - lev.price) / current_price <= HOT_LEVEL_DISTANCE_PCT
            });
            if direction == SignalDirection::Long && near_hot_resistance {
                return Some("hot_level".into());
            }
            if direction == SignalDirection::Short && near_hot_support {
                return Some("hot_level".into());
            }
        }
        // 8. Context-now as a primary gate.
        if s.use_context_now_primary && !s.use_context_now_only {
            if let Some(ctx) = context_now {
                if direction == SignalDirection::Long && !ctx.allowed_long {
                    return Some("context_now".into());
                }
                if direction == SignalDirection::Short && !ctx.allowed_short {
                    return Some("context_now".into());
                }
            }
        }
        // 9. Confidence floor.
        if confidence < s.min_confidence_to_open {
            return Some("confidence".into());
        }
        None
    }

    fn snapshot(&self, current_price: f64) -> SandboxState {
        SandboxState {
            position_side: self.side,
            entry_price: self.entry_price,
            entry_ts: self.entry_ts,
            size: self.size,
            leverage: self.current_leverage,
            margin_used: self.margin_used,
            peak_equity: self.peak_equity,
            initial_balance: self.settings.initial_balance,
            total_realized_pnl: self.total_realized_pnl,
            total_commission: self.total_commission,
            trades_count: self.trades.len(),
            unrealized_pnl: self.unrealized_pnl(current_price),
            current_price,
            equity: self.equity(current_price),
            last_signal_direction: self.last_signal_direction,
            last_signal_confidence: self.last_signal_confidence,
            last_signal_reason: self.last_signal_reason.clone(),
            last_ts: self.last_ts,
        }
    }

    pub fn summary(&self, current_price: f64) -> SandboxSummary {
        let closes: Vec<&TradeRow> = self
            .trades
            .iter()
            .filter(|t| t.action == TradeAction::Close.as_str())
            .collect();
        let pnls: Vec<f64> = closes
            .iter()
            .filter_map(|t| t.realized_pnl_usd)
            .collect();
        let mut exits_by: Vec<(String, usize)> = Vec::new();
        for t in &closes {
            let key = if t.exit_reason.is_empty() {
                ExitReason::Microstructure.as_str().to_string()
            } else {
                t.exit_reason.clone()
            };
            match exits_by.iter_mut().find(|(k, _)| *k == key) {
                Some((_, count)) => *count += 1,
                None => exits_by.push((key, 1)),
            }
        }
        SandboxSummary {
            trades_count: self.trades.len(),
            opens_count: self
                .trades
                .iter()
                .filter(|t| t.action == TradeAction::Open.as_str())
                .count(),
            closes_count: closes.len(),
            total_commission: self.total_commission,
            total_realized_pnl_gross: self.total_realized_pnl,
            total_realized_pnl_net: self.total_realized_pnl - self.total_commission,
            winning_trades: pnls.iter().filter(|p| **p > 0.0).count(),
            losing_trades: pnls.iter().filter(|p| **p < 0.0).count(),
            equity: self.equity(current_price),
            exits_by,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SweepSide;

    fn signal(direction: SignalDirection, confidence: f64) -> MicrostructureSignal {
        MicrostructureSignal {
            direction,
            confidence,
            reason: "test signal".into(),
            score: match direction {
                SignalDirection::Long => confidence,
                SignalDirection::Short => -confidence,
                SignalDirection::None => 0.0,
            },
            delta_contribution: 0.0,
            imbalance_contribution: 0.0,
            sweep_contribution: 0.0,
            delta_ratio: 0.0,
            imbalance_ratio: 0.5,
            last_sweep_side: None,
            sweep_only: false,
        }
    }

    fn of() -> OrderflowReport {
        OrderflowReport::default()
    }

    fn base_settings() -> SandboxSettings {
        SandboxSettings {
            initial_balance: 100.0,
            taker_fee: 0.0006,
            min_confidence_to_open: 0.3,
            leverage_min: 2.0,
            leverage_max: 2.0,
            adaptive_leverage: false,
            margin_fraction: 1.0,
            exit_min_confidence: 0.2,
            liquidation_maintenance: 1.0,
            ..SandboxSettings::default()
        }
    }

    #[test]
    fn open_close_round_trip_matches_fee_model() {
        let mut sandbox = Sandbox::new(base_settings());

        // Open long at 20 000 with confidence 0.5.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.5), &of(), 20_000.0, 0, None, None);
        assert_eq!(state.position_side, PositionSide::Long);
        assert!((state.size - 0.01).abs() < 1e-12);
        assert!((state.total_commission - 0.12).abs() < 1e-9);
        assert!((state.margin_used - 100.0).abs() < 1e-9);

        // Price rises to 21 000; microstructure confidence collapses → exit.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.1), &of(), 21_000.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        assert!((state.total_realized_pnl - 10.0).abs() < 1e-9);
        assert!((state.total_commission - (0.12 + 0.126)).abs() < 1e-9);
        assert!((state.equity - 109.754).abs() < 1e-9);
    }

    #[test]
    fn equity_identity_holds_every_tick() {
        let mut sandbox = Sandbox::new(base_settings());
        let prices = [20_000.0, 20_100.0, 19_900.0, 20_500.0];
        let mut ts = 0;
        for price in prices {
            let state = sandbox.update(&signal(SignalDirection::Long, 0.8), &of(), price, ts, None, None);
            let expected = state.initial_balance + state.total_realized_pnl
                - state.total_commission
                + state.unrealized_pnl;
            assert!((state.equity - expected).abs() < 1e-9);
            // flat <=> size == 0
            assert_eq!(state.position_side == PositionSide::Flat, state.size == 0.0);
            ts += 60;
        }
    }

    #[test]
    fn liquidation_at_margin_exhaustion() {
        let settings = SandboxSettings {
            leverage_min: 10.0,
            leverage_max: 10.0,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // notional 1000, size 0.05, margin 100.

        // -95 USD: still alive.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 18_100.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Long);

        // -100 USD: liquidated.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 18_000.0, 120, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        let last = sandbox.trades().last().unwrap();
        assert_eq!(last.exit_reason, "liquidation");
    }

    #[test]
    fn stop_loss_and_breakeven_sequence() {
        let settings = SandboxSettings {
            stop_loss_pct: 1.0,
            breakeven_trigger_pct: 0.5,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings.clone());
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // +0.6%: arms breakeven.
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_120.0, 60, None, None);
        // Back to entry: closes as breakeven, not stop_loss.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 120, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        assert_eq!(sandbox.trades().last().unwrap().exit_reason, "breakeven");

        // Fresh position going straight down closes as stop_loss.
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 19_700.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        assert_eq!(sandbox.trades().last().unwrap().exit_reason, "stop_loss");
    }

    #[test]
    fn trailing_stop_follows_peak() {
        let settings = SandboxSettings {
            trail_trigger_pct: 1.0,
            trail_pct: 0.5,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // +2.0%: trailing armed, peak = 2.0.
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_400.0, 60, None, None);
        // +1.4% <= peak - 0.5 → trailing stop.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_280.0, 120, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        assert_eq!(sandbox.trades().last().unwrap().exit_reason, "trailing_stop");
    }

    #[test]
    fn tp_ladder_closes_cumulative_shares() {
        let settings = SandboxSettings {
            tp_levels: vec![
                TpLevel {
                    level_pct: 0.5,
                    cumulative_share: 0.5,
                },
                TpLevel {
                    level_pct: 1.0,
                    cumulative_share: 1.0,
                },
            ],
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        let initial_size = sandbox.size;

        // +0.6%: first rung → half the initial size goes.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_120.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Long);
        assert!((sandbox.size - initial_size * 0.5).abs() < 1e-12);
        assert!((sandbox.tp_closed_share - 0.5).abs() < 1e-9);

        // +1.2%: second rung → residual share closes the position.
        let state = sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_240.0, 120, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
        let parts = sandbox
            .trades()
            .iter()
            .filter(|t| t.exit_reason == "take_profit_part")
            .count();
        assert_eq!(parts, 2);
    }

    #[test]
    fn same_tick_gate_blocks_reentry_after_stop() {
        let settings = SandboxSettings {
            stop_loss_pct: 1.0,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // Stop out and try to re-enter in the same tick → same_tick_as_close.
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 19_700.0, 60, None, None);
        assert!(sandbox
            .skips()
            .iter()
            .any(|s| s.skip_reason == "same_tick_as_close"));
        assert_eq!(sandbox.position_side(), PositionSide::Flat);
    }

    #[test]
    fn cooldown_gate_blocks_reentry_after_close() {
        let settings = SandboxSettings {
            cooldown_secs: 120,
            stop_loss_pct: 1.0,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 19_700.0, 60, None, None);
        // 60 s after the close: still inside the 120 s cooldown.
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 19_700.0, 120, None, None);
        assert!(sandbox.skips().iter().any(|s| s.skip_reason == "cooldown"));
        assert_eq!(sandbox.position_side(), PositionSide::Flat);
    }

    #[test]
    fn sweep_only_and_trend_filter_gates() {
        let settings = SandboxSettings {
            trend_filter: true,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);

        let mut sweep_signal = signal(SignalDirection::Long, 0.9);
        sweep_signal.sweep_only = true;
        sweep_signal.last_sweep_side = Some(SweepSide::Bid);
        sandbox.update(&sweep_signal, &of(), 20_000.0, 0, None, None);
        assert!(sandbox.skips().iter().any(|s| s.skip_reason == "sweep_only"));

        sandbox.update(
            &signal(SignalDirection::Long, 0.9),
            &of(),
            20_000.0,
            60,
            Some(TrendDirection::Down),
            None,
        );
        assert!(sandbox.skips().iter().any(|s| s.skip_reason == "trend_filter"));
        assert_eq!(sandbox.position_side(), PositionSide::Flat);
    }

    #[test]
    fn context_reading_labels_entry_type() {
        // Primary gate off, but a supplied context reading still labels the
        // open as context_now_primary.
        let mut sandbox = Sandbox::new(base_settings());
        let ctx = ContextNow::default();
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, Some(&ctx));
        let open = sandbox.trades().last().unwrap();
        assert_eq!(open.action, "open");
        assert_eq!(open.entry_type, "context_now_primary");

        // No context reading: plain microstructure entry.
        let mut sandbox = Sandbox::new(base_settings());
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        assert_eq!(sandbox.trades().last().unwrap().entry_type, "microstructure");
    }

    #[test]
    fn sweep_only_gate_applies_in_context_only_mode() {
        let settings = SandboxSettings {
            use_context_now_only: true,
            min_confidence_to_open: 0.0,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        let ctx = ContextNow {
            at_support: true,
            flow_bullish_now: true,
            allowed_long: true,
            short_window_delta_ratio: 0.3,
            ..ContextNow::default()
        };
        let mut sweep_signal = signal(SignalDirection::None, 0.0);
        sweep_signal.sweep_only = true;
        sweep_signal.last_sweep_side = Some(SweepSide::Bid);
        sandbox.update(&sweep_signal, &of(), 20_000.0, 0, None, Some(&ctx));
        assert_eq!(sandbox.position_side(), PositionSide::Flat);
        assert!(sandbox.skips().iter().any(|s| s.skip_reason == "sweep_only"));
    }

    #[test]
    fn low_confidence_is_skipped() {
        let mut sandbox = Sandbox::new(base_settings());
        sandbox.update(&signal(SignalDirection::Long, 0.2), &of(), 20_000.0, 0, None, None);
        assert_eq!(sandbox.position_side(), PositionSide::Flat);
        assert!(sandbox.skips().iter().any(|s| s.skip_reason == "confidence"));
    }

    #[test]
    fn opposite_signal_reverses_position() {
        let settings = SandboxSettings {
            exit_min_confidence: 0.0,
            exit_none_ticks: 10, // microstructure exit will not fire first
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        assert_eq!(sandbox.position_side(), PositionSide::Long);

        let state = sandbox.update(&signal(SignalDirection::Short, 0.9), &of(), 20_100.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Short);
        // One close (the reversal) and two opens recorded.
        let summary = sandbox.summary(20_100.0);
        assert_eq!(summary.opens_count, 2);
        assert_eq!(summary.closes_count, 1);
    }

    #[test]
    fn min_hold_blocks_early_microstructure_exit() {
        let settings = SandboxSettings {
            min_hold_secs: 300,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // Signal dies immediately, but the position is only 60s old.
        let state = sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 20_010.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Long);
        // Past min-hold the same condition closes it.
        let state = sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 20_010.0, 400, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
    }

    #[test]
    fn exit_window_needs_enough_flags() {
        let settings = SandboxSettings {
            exit_window_ticks: 3,
            exit_window_need: 2,
            exit_min_confidence: 0.0,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // Window fills: [exit, stay, exit] → 2 of 3 → closes on the third.
        sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 20_000.0, 60, None, None);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 120, None, None);
        let state = sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 20_000.0, 180, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
    }

    #[test]
    fn min_profit_guard_defers_exit_in_small_profit() {
        let settings = SandboxSettings {
            min_profit_pct: 0.5,
            ..base_settings()
        };
        let mut sandbox = Sandbox::new(settings);
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        // +0.1% profit, signal gone: guard keeps the position.
        let state = sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 20_020.0, 60, None, None);
        assert_eq!(state.position_side, PositionSide::Long);
        // At a loss the guard does not apply.
        let state = sandbox.update(&signal(SignalDirection::None, 0.0), &of(), 19_950.0, 120, None, None);
        assert_eq!(state.position_side, PositionSide::Flat);
    }

    #[test]
    fn adaptive_leverage_scales_with_confidence_and_drawdown() {
        let settings = SandboxSettings {
            leverage_min: 1.0,
            leverage_max: 5.0,
            adaptive_leverage: true,
            min_confidence_to_open: 0.0,
            ..SandboxSettings::default()
        };
        let mut sandbox = Sandbox::new(settings);
        let lev = sandbox.compute_leverage(0.5, 100.0);
        assert!((lev - 3.0).abs() < 1e-9);

        // 20% drawdown from peak caps leverage at the midpoint.
        sandbox.peak_equity = 100.0;
        let lev = sandbox.compute_leverage(1.0, 80.0);
        assert!((lev - 3.0).abs() < 1e-9);
    }

    #[test]
    fn realized_pnl_sums_match_summary() {
        let mut sandbox = Sandbox::new(base_settings());
        sandbox.update(&signal(SignalDirection::Long, 0.9), &of(), 20_000.0, 0, None, None);
        sandbox.update(&signal(SignalDirection::Long, 0.1), &of(), 21_000.0, 60, None, None);
        sandbox.update(&signal(SignalDirection::Short, 0.9), &of(), 21_000.0, 600, None, None);
        sandbox.update(&signal(SignalDirection::Short, 0.1), &of(), 20_500.0, 660, None, None);

        let summary = sandbox.summary(20_500.0);
        let sum_from_rows: f64 = sandbox
            .trades()
            .iter()
            .filter_map(|t| t.realized_pnl_usd)
            .sum();
        assert!((sum_from_rows - summary.total_realized_pnl_gross).abs() < 1e-9);
        assert_eq!(summary.winning_trades + summary.losing_trades, summary.closes_count);
    }
}
