// =============================================================================
// Durable archives (sqlite, WAL)
// =============================================================================

pub mod candle_store;
pub mod paper_store;

pub use candle_store::{CandleSource, CandleStore};
pub use paper_store::{OrderflowMetricsRow, PaperStore, RunRow, SkipRow, TradeRow};
