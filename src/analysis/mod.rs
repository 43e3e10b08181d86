// =============================================================================
// Analysis layer — per-timeframe classifiers and the multi-TF coordinator
// =============================================================================

pub mod context_now;
pub mod microstructure;
pub mod multi_tf;
pub mod orderflow;
pub mod phase_indicators;
pub mod phase_structure;
pub mod phases;
pub mod quality;
pub mod trend;
pub mod zones;
