// =============================================================================
// Published sandbox state
// =============================================================================
//
// The control loop owns the sandbox; everything else (logs, external
// surfaces) reads the last published snapshot from this store. One of the
// two process-wide mutables in the engine (the other is the coordinator's
// stability history).
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{PositionSide, SignalDirection};

/// Serializable snapshot of the sandbox after one tick.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxState {
    pub position_side: PositionSide,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub size: f64,
    pub leverage: f64,
    pub margin_used: f64,
    pub peak_equity: f64,
    pub initial_balance: f64,
    /// Gross realized PnL (before commissions).
    pub total_realized_pnl: f64,
    pub total_commission: f64,
    pub trades_count: usize,
    pub unrealized_pnl: f64,
    pub current_price: f64,
    pub equity: f64,
    pub last_signal_direction: SignalDirection,
    pub last_signal_confidence: f64,
    pub last_signal_reason: String,
    pub last_ts: i64,
}

/// Last-state store readable by external surfaces.
#[derive(Default)]
pub struct LastStateStore {
    state: RwLock<Option<SandboxState>>,
}

impl LastStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: SandboxState) {
        *self.state.write() = Some(state);
    }

    pub fn last(&self) -> Option<SandboxState> {
        self.state.read().clone()
    }

    /// Explicit reset, used when a backtest run starts.
    pub fn clear(&self) {
        *self.state.write() = None;
    }
}
