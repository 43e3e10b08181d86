// =============================================================================
// Borealis — control-loop binary
// =============================================================================
//
// Startup: .env config (fatal on validation errors, exit 1), sqlite archives
// (WAL), optional WS ingestion tasks with reconnect loops, then the periodic
// control tick until Ctrl+C (exit 130). Paper-trading runs are recorded in
// the archive: a live run row opens at start and is patched at shutdown;
// unfinished backtest runs are purged first.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use borealis_bot::analysis::multi_tf::CoordinatorState;
use borealis_bot::bot_loop::{self, TickSettings, TickState};
use borealis_bot::config::Config;
use borealis_bot::sandbox::{LastStateStore, Sandbox, SandboxSettings, TradeLog};
use borealis_bot::store::{CandleStore, PaperStore};
use borealis_bot::types::RunSource;
use borealis_bot::venue::orderbook_ws::{public_ws_url, run_orderbook_stream};
use borealis_bot::venue::trades_ws::run_trades_stream;
use borealis_bot::venue::{snap_ws_depth, BybitClient, LiveOrderBook, TradeTape};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env();
    let errors = cfg.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("config: {e}");
        }
        std::process::exit(1);
    }

    info!(
        symbol = %cfg.symbol,
        timeframes = ?cfg.timeframes_analysis.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        orderflow = cfg.orderflow_enabled,
        sandbox = cfg.sandbox_enabled,
        "borealis starting"
    );

    // ── Archives ────────────────────────────────────────────────────────
    let store = Arc::new(CandleStore::open(&cfg.db_path)?);
    let paper = Arc::new(PaperStore::open(&cfg.db_path.with_extension("paper.db"))?);
    paper.purge_unfinished_backtests()?;

    // ── Venue client ────────────────────────────────────────────────────
    let client = BybitClient::new(&cfg)?;

    // ── WS ingestion (optional) ─────────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    let mut book: Option<Arc<LiveOrderBook>> = None;
    let mut tape: Option<Arc<TradeTape>> = None;
    if cfg.orderflow_enabled {
        let url = public_ws_url(cfg.testnet, &cfg.category);
        let depth = snap_ws_depth(cfg.orderbook_limit);

        let live_book = Arc::new(LiveOrderBook::new(cfg.symbol.clone()));
        let task_book = live_book.clone();
        let task_url = url.clone();
        let task_symbol = cfg.symbol.clone();
        let task_stop = stop.clone();
        let ping = cfg.orderflow_ws_ping_interval_secs;
        tokio::spawn(async move {
            while !task_stop.load(Ordering::Relaxed) {
                if let Err(e) = run_orderbook_stream(
                    &task_url,
                    &task_symbol,
                    depth,
                    task_book.clone(),
                    ping,
                    task_stop.clone(),
                )
                .await
                {
                    error!(symbol = %task_symbol, error = %e, "orderbook stream error — reconnecting in 5s");
                }
                if task_stop.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
        book = Some(live_book);

        let live_tape = Arc::new(TradeTape::new(cfg.symbol.clone(), cfg.trades_buffer_capacity));
        let task_tape = live_tape.clone();
        let task_symbol = cfg.symbol.clone();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            while !task_stop.load(Ordering::Relaxed) {
                if let Err(e) = run_trades_stream(
                    &url,
                    &task_symbol,
                    task_tape.clone(),
                    ping,
                    task_stop.clone(),
                )
                .await
                {
                    error!(symbol = %task_symbol, error = %e, "trades stream error — reconnecting in 5s");
                }
                if task_stop.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
        tape = Some(live_tape);
        info!(symbol = %cfg.symbol, depth, "market data streams launched");
    }

    // ── Sandbox ─────────────────────────────────────────────────────────
    let mut sandbox: Option<Sandbox> = None;
    let mut run_id: Option<String> = None;
    if cfg.sandbox_enabled {
        let id = uuid::Uuid::new_v4().to_string();
        paper.insert_run(
            &id,
            &cfg.symbol,
            RunSource::Live,
            cfg.sandbox_initial_balance,
            None,
            None,
            chrono::Utc::now().timestamp(),
        )?;
        let log = TradeLog::new(&cfg.log_dir)?;
        sandbox = Some(
            Sandbox::new(SandboxSettings::from_config(&cfg))
                .with_log(log)
                .with_store(paper.clone(), id.clone()),
        );
        run_id = Some(id);
        info!(balance = cfg.sandbox_initial_balance, "sandbox armed");
    }

    // ── Control loop ────────────────────────────────────────────────────
    let settings = TickSettings::from_config(&cfg);
    let coordinator = CoordinatorState::new();
    let last_state = Arc::new(LastStateStore::new());
    let mut tick_state = TickState::new();

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs_f64(cfg.poll_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("all subsystems running, Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let result = bot_loop::run_tick(
                    &client,
                    &store,
                    Some(&paper),
                    &cfg,
                    &settings,
                    &coordinator,
                    book.as_ref(),
                    tape.as_ref(),
                    sandbox.as_mut(),
                    &last_state,
                    &mut tick_state,
                    now_ms,
                )
                .await;
                if let Err(e) = result {
                    // A failed tick never kills the loop.
                    error!(error = %e, "tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received — stopping");
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────────
    stop.store(true, Ordering::Relaxed);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    if let (Some(sandbox), Some(run_id)) = (&sandbox, &run_id) {
        let price = last_state
            .last()
            .map(|s| s.current_price)
            .unwrap_or_default();
        let summary = sandbox.summary(price);
        if let Err(e) = paper.finish_run(
            run_id,
            chrono::Utc::now().timestamp(),
            summary.equity,
            summary.total_realized_pnl_net,
            summary.total_commission,
            summary.closes_count as i64,
        ) {
            error!(error = %e, "failed to finish sandbox run");
        }
        info!(
            equity = summary.equity,
            net_pnl = summary.total_realized_pnl_net,
            trades = summary.closes_count,
            wins = summary.winning_trades,
            losses = summary.losing_trades,
            "sandbox run closed"
        );
    }

    info!("borealis stopped");
    std::process::exit(130);
}
