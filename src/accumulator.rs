// =============================================================================
// Accumulator — keeps the candle archive fed
// =============================================================================
//
// Backfill (empty series), extend (deepen history), catch-up (close the gap
// to now), fill-gap (repair interior holes), and the periodic tick that runs
// catch-up for every configured timeframe. Every operation is idempotent:
// the store drops duplicates on its primary key, so re-running any of these
// inserts nothing new. A failing timeframe is logged and skipped; it never
// aborts the tick.
// =============================================================================

use anyhow::Result;
use tracing::{error, info};

use crate::market_data::Candle;
use crate::store::CandleStore;
use crate::types::Timeframe;
use crate::venue::BybitClient;

/// Candle supply for the accumulator: the REST client in production, a
/// canned dataset in tests.
#[allow(async_fn_in_trait)]
pub trait KlineSource {
    async fn klines(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>>;

    async fn klines_backfill(
        &self,
        symbol: &str,
        tf: Timeframe,
        end_ms: i64,
        max_candles: Option<usize>,
    ) -> Result<Vec<Candle>>;
}

impl KlineSource for BybitClient {
    async fn klines(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        self.get_klines(symbol, tf, limit, start_ms, end_ms).await
    }

    async fn klines_backfill(
        &self,
        symbol: &str,
        tf: Timeframe,
        end_ms: i64,
        max_candles: Option<usize>,
    ) -> Result<Vec<Candle>> {
        self.fetch_klines_backfill(symbol, tf, end_ms, max_candles)
            .await
    }
}

/// Chunk size for range walks; matches the venue's page limit.
const CHUNK: usize = 1000;

/// Backfill a series that the store has never seen: page backward from
/// `now_ms` until `max_candles` or the venue runs out. No-op when the
/// series already holds bars. Returns rows inserted.
pub async fn backfill_timeframe<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    tf: Timeframe,
    max_candles: usize,
    now_ms: i64,
) -> Result<usize> {
    if store.latest_start(symbol, tf)?.is_some() {
        return Ok(0);
    }
    info!(symbol, tf = %tf, "backfilling empty series");
    let candles = source
        .klines_backfill(symbol, tf, now_ms, Some(max_candles))
        .await?;
    let inserted = store.insert_candles(symbol, tf, &candles)?;
    info!(symbol, tf = %tf, fetched = candles.len(), inserted, "backfill done");
    Ok(inserted)
}

/// Deepen history by one page below the current oldest bar. Returns rows
/// inserted (0 when the series is empty or the venue has nothing older).
pub async fn extend_backward_one_chunk<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    tf: Timeframe,
    max_candles: usize,
) -> Result<usize> {
    let Some(oldest) = store.oldest_start(symbol, tf)? else {
        return Ok(0);
    };
    let candles = source
        .klines_backfill(symbol, tf, oldest - 1, Some(max_candles))
        .await?;
    store.insert_candles(symbol, tf, &candles)
}

/// Keep extending every configured timeframe until the venue stops
/// returning older data. Returns per-TF inserted totals.
pub async fn extend_until_done<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    timeframes: &[Timeframe],
    max_candles: usize,
) -> Vec<(Timeframe, usize)> {
    let mut totals = Vec::with_capacity(timeframes.len());
    for &tf in timeframes {
        let mut total = 0usize;
        loop {
            match extend_backward_one_chunk(source, store, symbol, tf, max_candles).await {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    info!(symbol, tf = %tf, deepened = n, "history extended");
                }
                Err(e) => {
                    error!(symbol, tf = %tf, error = %e, "extend failed, moving on");
                    break;
                }
            }
        }
        totals.push((tf, total));
    }
    totals
}

/// Fetch `[latest + tf, now]` in chunks until exhausted. Skips the calendar
/// month (no fixed duration) and empty series. Returns rows inserted.
pub async fn catch_up_timeframe<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    tf: Timeframe,
    now_ms: i64,
) -> Result<usize> {
    let Some(latest) = store.latest_start(symbol, tf)? else {
        return Ok(0);
    };
    let Some(interval_ms) = tf.duration_ms() else {
        return Ok(0);
    };
    let mut start_ms = latest + interval_ms;
    if start_ms >= now_ms {
        return Ok(0);
    }
    let mut total = 0usize;
    loop {
        let candles = source
            .klines(symbol, tf, CHUNK, Some(start_ms), Some(now_ms))
            .await?;
        if candles.is_empty() {
            break;
        }
        total += store.insert_candles(symbol, tf, &candles)?;
        let last_start = candles.last().expect("non-empty").start_time;
        if candles.len() < CHUNK {
            break;
        }
        start_ms = last_start + interval_ms;
        if start_ms >= now_ms {
            break;
        }
    }
    Ok(total)
}

/// Repair interior holes: walk `[oldest + tf, latest - tf]` and insert
/// whatever the store is missing (dedupe makes re-inserts free). A no-op on
/// a dense archive. Returns rows inserted.
pub async fn fill_gap_timeframe<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    tf: Timeframe,
) -> Result<usize> {
    let (Some(oldest), Some(latest)) = (
        store.oldest_start(symbol, tf)?,
        store.latest_start(symbol, tf)?,
    ) else {
        return Ok(0);
    };
    let Some(interval_ms) = tf.duration_ms() else {
        return Ok(0);
    };
    let mut start_ms = oldest + interval_ms;
    let end_ms = latest - interval_ms;
    if start_ms >= end_ms {
        return Ok(0);
    }
    let mut total = 0usize;
    loop {
        let candles = source
            .klines(symbol, tf, CHUNK, Some(start_ms), Some(end_ms))
            .await?;
        if candles.is_empty() {
            break;
        }
        total += store.insert_candles(symbol, tf, &candles)?;
        let last_start = candles.last().expect("non-empty").start_time;
        if candles.len() < CHUNK {
            break;
        }
        start_ms = last_start + interval_ms;
        if start_ms >= end_ms {
            break;
        }
    }
    Ok(total)
}

/// One accumulator tick: catch up every configured timeframe. Per-TF errors
/// are logged and skipped. Returns per-TF inserted counts.
pub async fn catch_up_all<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    timeframes: &[Timeframe],
    now_ms: i64,
) -> Vec<(Timeframe, usize)> {
    let mut totals = Vec::with_capacity(timeframes.len());
    for &tf in timeframes {
        match catch_up_timeframe(source, store, symbol, tf, now_ms).await {
            Ok(n) => totals.push((tf, n)),
            Err(e) => {
                error!(symbol, tf = %tf, error = %e, "catch-up failed, moving on");
                totals.push((tf, 0));
            }
        }
    }
    totals
}

/// Startup pass: backfill empty series, then pull the newest page for each
/// timeframe. Per-TF errors never abort the pass.
pub async fn run_once<S: KlineSource>(
    source: &S,
    store: &CandleStore,
    symbol: &str,
    timeframes: &[Timeframe],
    backfill: bool,
    max_candles: usize,
    now_ms: i64,
) -> Vec<(Timeframe, usize)> {
    let mut totals = Vec::with_capacity(timeframes.len());
    for &tf in timeframes {
        let result: Result<usize> = async {
            if backfill {
                backfill_timeframe(source, store, symbol, tf, max_candles, now_ms).await?;
            }
            let candles = source.klines(symbol, tf, 500, None, None).await?;
            store.insert_candles(symbol, tf, &candles)
        }
        .await;
        match result {
            Ok(n) => totals.push((tf, n)),
            Err(e) => {
                error!(symbol, tf = %tf, error = %e, "accumulator pass failed for timeframe");
                totals.push((tf, 0));
            }
        }
    }
    totals
}
