// =============================================================================
// Control loop tick
// =============================================================================
//
// One pass: refresh the candle archive when due, run the multi-TF analysis,
// derive order flow + the microstructure signal from the live book and
// tape, step the sandbox at the book mid price, publish the snapshot, and
// emit one compact signal line. main.rs owns the loop and the pause.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::accumulator::{self, KlineSource};
use crate::analysis::context_now::{compute_context_now, ContextNowSettings};
use crate::analysis::microstructure::{compute_microstructure_signal, MicrostructureSettings};
use crate::analysis::multi_tf::{
    analyze_multi_timeframe, CoordinatorSettings, CoordinatorState, MultiTfReport,
};
use crate::analysis::orderflow::{analyze_orderflow, OrderflowReport, OrderflowSettings};
use crate::config::Config;
use crate::market_data::BookSnapshot;
use crate::sandbox::{LastStateStore, Sandbox};
use crate::store::{CandleStore, OrderflowMetricsRow, PaperStore};
use crate::venue::{LiveOrderBook, TradeTape};

/// Candles fed into sweep detection from the lowest archive timeframe.
const SWEEP_LOOKBACK_CANDLES: usize = 10;

/// All per-tick analysis knobs, resolved once at startup.
#[derive(Clone)]
pub struct TickSettings {
    pub coordinator: CoordinatorSettings,
    pub orderflow: OrderflowSettings,
    pub microstructure: MicrostructureSettings,
    pub context_now: ContextNowSettings,
}

impl TickSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            coordinator: CoordinatorSettings::from_config(cfg),
            orderflow: OrderflowSettings {
                window_secs: cfg.orderflow_window_secs,
                short_window_secs: cfg.orderflow_short_window_secs,
                ..OrderflowSettings::default()
            },
            microstructure: MicrostructureSettings {
                min_score_for_direction: cfg.microstructure_min_score,
                ..MicrostructureSettings::default()
            },
            context_now: ContextNowSettings::default(),
        }
    }
}

/// Long-lived mutable pieces the tick threads through iterations.
pub struct TickState {
    pub last_db_refresh_ms: i64,
    pub prev_book: Option<BookSnapshot>,
}

impl TickState {
    pub fn new() -> Self {
        Self {
            last_db_refresh_ms: 0,
            prev_book: None,
        }
    }
}

impl Default for TickState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TickOutcome {
    pub report: MultiTfReport,
    pub orderflow: Option<OrderflowReport>,
}

/// Run one control tick at `now_ms`.
#[allow(clippy::too_many_arguments)]
pub async fn run_tick<S: KlineSource>(
    venue: &S,
    store: &CandleStore,
    paper: Option<&Arc<PaperStore>>,
    cfg: &Config,
    settings: &TickSettings,
    coordinator: &CoordinatorState,
    book: Option<&Arc<LiveOrderBook>>,
    tape: Option<&Arc<TradeTape>>,
    sandbox: Option<&mut Sandbox>,
    last_state: &LastStateStore,
    tick_state: &mut TickState,
    now_ms: i64,
) -> Result<TickOutcome> {
    // 1. Archive refresh, at most once per interval.
    let refresh_due_ms = (cfg.db_update_interval_secs * 1000.0) as i64;
    if now_ms - tick_state.last_db_refresh_ms >= refresh_due_ms {
        let totals =
            accumulator::catch_up_all(venue, store, &cfg.symbol, &cfg.timeframes_db, now_ms).await;
        let inserted: usize = totals.iter().map(|(_, n)| n).sum();
        if inserted > 0 {
            info!(symbol = %cfg.symbol, inserted, "archive refreshed");
        }
        tick_state.last_db_refresh_ms = now_ms;
    }

    // 2. Multi-TF report.
    let report = analyze_multi_timeframe(
        store,
        &cfg.symbol,
        &cfg.timeframes_analysis,
        coordinator,
        &settings.coordinator,
    )?;

    // 3. Order flow + sandbox.
    let mut orderflow = None;
    if cfg.orderflow_enabled && (book.is_some() || tape.is_some()) {
        let snapshot = book.map(|b| b.snapshot());
        let window_ms = (settings.orderflow.window_secs * 1000.0) as i64;
        let trades = tape
            .map(|t| t.recent_since(now_ms - window_ms))
            .unwrap_or_default();
        let sweep_candles = cfg
            .timeframes_db
            .first()
            .map(|&tf| store.candles(&cfg.symbol, tf, false, Some(SWEEP_LOOKBACK_CANDLES)))
            .transpose()?
            .unwrap_or_default();

        let of = analyze_orderflow(
            snapshot.as_ref(),
            tick_state.prev_book.as_ref(),
            &trades,
            &sweep_candles,
            Some(&report.trading_zones),
            Some(now_ms),
            &settings.orderflow,
        );

        if cfg.orderflow_save_to_db {
            if let Some(paper) = paper {
                let row = orderflow_metrics_row(&of);
                if let Err(e) = paper.insert_orderflow_metrics(&cfg.symbol, now_ms / 1000, &row) {
                    debug!(error = %e, "orderflow metrics row skipped");
                }
            }
        }

        if let (Some(sandbox), Some(snapshot)) = (sandbox, snapshot.as_ref()) {
            if let Some(mid) = snapshot.mid_price() {
                // A context reading is supplied only when a context mode is
                // configured; its presence labels the entry type.
                let ctx = (cfg.sandbox_use_context_now_primary || cfg.sandbox_use_context_now_only)
                    .then(|| {
                        compute_context_now(
                            mid,
                            &of,
                            Some(&report.trading_zones),
                            &settings.context_now,
                        )
                    });
                let signal = compute_microstructure_signal(&of, &settings.microstructure);
                let state = sandbox.update(
                    &signal,
                    &of,
                    mid,
                    now_ms / 1000,
                    Some(report.higher_tf_trend),
                    ctx.as_ref(),
                );
                info!(
                    position = %state.position_side,
                    entry = state.entry_price,
                    realized = state.total_realized_pnl,
                    unrealized = state.unrealized_pnl,
                    equity = state.equity,
                    signal = %state.last_signal_direction,
                    confidence = state.last_signal_confidence,
                    "sandbox"
                );
                last_state.publish(state);
            } else {
                warn!("sandbox step skipped: book has no mid price yet");
            }
        }

        tick_state.prev_book = snapshot;
        orderflow = Some(of);
    }

    log_report(&report, orderflow.as_ref());
    Ok(TickOutcome { report, orderflow })
}

fn orderflow_metrics_row(of: &OrderflowReport) -> OrderflowMetricsRow {
    OrderflowMetricsRow {
        imbalance_ratio: of.dom.as_ref().map(|d| d.imbalance_ratio),
        bid_volume: of.dom.as_ref().map(|d| d.raw_bid_volume),
        ask_volume: of.dom.as_ref().map(|d| d.raw_ask_volume),
        delta: of.volume_delta.as_ref().map(|d| d.delta),
        buy_volume: of.volume_delta.as_ref().map(|d| d.buy_volume),
        sell_volume: of.volume_delta.as_ref().map(|d| d.sell_volume),
        delta_ratio: of.volume_delta.as_ref().map(|d| d.delta_ratio),
        volume_per_sec: of.time_and_sales.as_ref().map(|t| t.volume_per_sec),
        trades_count: of
            .time_and_sales
            .as_ref()
            .map(|t| t.trades_count as i64),
        is_volume_spike: of
            .time_and_sales
            .as_ref()
            .is_some_and(|t| t.is_volume_spike),
        last_sweep_side: of.sweeps.as_ref().and_then(|s| {
            s.last_sweep_side.map(|side| match side {
                crate::types::SweepSide::Bid => "bid".to_string(),
                crate::types::SweepSide::Ask => "ask".to_string(),
            })
        }),
        last_sweep_time: of.sweeps.as_ref().and_then(|s| s.last_sweep_time),
    }
}

/// One compact signal line plus the per-TF breakdown at debug.
fn log_report(report: &MultiTfReport, orderflow: Option<&OrderflowReport>) {
    info!(
        direction = %report.signals.direction,
        entry_score = report.signals.entry_score,
        confidence = report.signals.confidence,
        ready = report.signals.phase_decision_ready,
        higher_tf = %report.higher_tf,
        trend = %report.higher_tf_trend,
        phase = %report.higher_tf_phase,
        regime = %report.higher_tf_regime,
        reason = %report.signals.reason,
        "signal"
    );
    debug!("{}", report.market_state_narrative);
    for tf_report in &report.timeframes {
        debug!(
            tf = %tf_report.tf,
            trend = %tf_report.trend.direction,
            strength = tf_report.trend.strength,
            phase = %tf_report.phase.phase,
            score = tf_report.phase.score,
            stable = tf_report.phase_stable,
            candles = tf_report.candles.len(),
            "timeframe"
        );
    }
    if let Some(of) = orderflow {
        if let (Some(dom), Some(delta)) = (&of.dom, &of.volume_delta) {
            debug!(
                imbalance = dom.imbalance_ratio,
                delta = delta.delta,
                delta_ratio = delta.delta_ratio,
                sweep = ?of.sweeps.as_ref().and_then(|s| s.last_sweep_side),
                "orderflow"
            );
        }
    }
}
