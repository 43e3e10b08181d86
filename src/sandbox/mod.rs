// =============================================================================
// Sandbox — virtual leveraged position driven by the microstructure signal
// =============================================================================

pub mod engine;
pub mod sink;
pub mod state;

pub use engine::{Sandbox, SandboxSettings, SandboxSummary};
pub use sink::TradeLog;
pub use state::{LastStateStore, SandboxState};
