// =============================================================================
// Microstructure signal — reduce order flow to long / short / none
// =============================================================================
//
// Three bounded contributions: volume delta (±0.4), depth imbalance (±0.3),
// and the most recent sweep (±sweep_weight). Their clamped sum is the score
// in [-1, 1]; |score| is the confidence. `sweep_only` flags a signal whose
// only support is the sweep — the sandbox refuses those entries.
// =============================================================================

use serde::Serialize;

use crate::types::{SignalDirection, SweepSide};

use super::orderflow::OrderflowReport;

#[derive(Debug, Clone, Copy)]
pub struct MicrostructureSettings {
    /// |delta_ratio| must exceed this before delta contributes.
    pub delta_ratio_min: f64,
    /// Imbalance inside `0.5 ± eps` is treated as neutral.
    pub imbalance_eps: f64,
    /// Contribution of the last sweep (bid = +, ask = -).
    pub sweep_weight: f64,
    /// |score| needed for a direction; below it the signal is none.
    pub min_score_for_direction: f64,
}

impl Default for MicrostructureSettings {
    fn default() -> Self {
        Self {
            delta_ratio_min: 0.15,
            imbalance_eps: 0.08,
            sweep_weight: 0.3,
            min_score_for_direction: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MicrostructureSignal {
    pub direction: SignalDirection,
    /// |score|, 0..1.
    pub confidence: f64,
    pub reason: String,
    pub score: f64,
    pub delta_contribution: f64,
    pub imbalance_contribution: f64,
    pub sweep_contribution: f64,
    pub delta_ratio: f64,
    pub imbalance_ratio: f64,
    pub last_sweep_side: Option<SweepSide>,
    /// The sweep is the only non-zero contribution.
    pub sweep_only: bool,
}

pub fn compute_microstructure_signal(
    of: &OrderflowReport,
    settings: &MicrostructureSettings,
) -> MicrostructureSignal {
    let delta_ratio = of.volume_delta.as_ref().map_or(0.0, |d| d.delta_ratio);
    let imbalance_ratio = of.dom.as_ref().map_or(0.5, |d| d.imbalance_ratio);
    let last_sweep = of.sweeps.as_ref().and_then(|s| s.last_sweep_side);

    let delta_contribution = if delta_ratio >= settings.delta_ratio_min {
        (0.2 + (delta_ratio - settings.delta_ratio_min) * 0.5).min(0.4)
    } else if delta_ratio <= -settings.delta_ratio_min {
        (-0.2 + (delta_ratio + settings.delta_ratio_min) * 0.5).max(-0.4)
    } else {
        0.0
    };

    let imbalance_contribution = if imbalance_ratio >= 0.5 + settings.imbalance_eps {
        ((imbalance_ratio - 0.5) * 2.0).min(0.3)
    } else if imbalance_ratio <= 0.5 - settings.imbalance_eps {
        ((imbalance_ratio - 0.5) * 2.0).max(-0.3)
    } else {
        0.0
    };

    let sweep_contribution = match last_sweep {
        // A swept bid means stops below were taken — bounce expected.
        Some(SweepSide::Bid) => settings.sweep_weight,
        Some(SweepSide::Ask) => -settings.sweep_weight,
        None => 0.0,
    };

    let score =
        (delta_contribution + imbalance_contribution + sweep_contribution).clamp(-1.0, 1.0);
    let confidence = score.abs();
    let sweep_only =
        sweep_contribution != 0.0 && delta_contribution == 0.0 && imbalance_contribution == 0.0;

    let (direction, reason) = if score >= settings.min_score_for_direction {
        (
            SignalDirection::Long,
            reason_parts(delta_contribution, imbalance_contribution, sweep_contribution, last_sweep, "long"),
        )
    } else if score <= -settings.min_score_for_direction {
        (
            SignalDirection::Short,
            reason_parts(delta_contribution, imbalance_contribution, sweep_contribution, last_sweep, "short"),
        )
    } else {
        (
            SignalDirection::None,
            "microstructure neutral (delta/imbalance/sweep below threshold)".to_string(),
        )
    };

    MicrostructureSignal {
        direction,
        confidence,
        reason,
        score,
        delta_contribution,
        imbalance_contribution,
        sweep_contribution,
        delta_ratio,
        imbalance_ratio,
        last_sweep_side: last_sweep,
        sweep_only,
    }
}

fn reason_parts(
    delta: f64,
    imbalance: f64,
    sweep: f64,
    last_sweep: Option<SweepSide>,
    side: &str,
) -> String {
    let mut parts = Vec::new();
    if delta.abs() >= 0.1 {
        parts.push(format!(
            "delta {}",
            if delta > 0.0 { "positive" } else { "negative" }
        ));
    }
    if imbalance.abs() >= 0.05 {
        parts.push(format!(
            "imbalance {}",
            if imbalance > 0.0 { "bid" } else { "ask" }
        ));
    }
    if let Some(sweep_side) = last_sweep {
        if sweep.abs() >= 0.1 {
            parts.push(format!(
                "sweep {}",
                match sweep_side {
                    SweepSide::Bid => "bid",
                    SweepSide::Ask => "ask",
                }
            ));
        }
    }
    if parts.is_empty() {
        format!("microstructure leaning slightly {side}")
    } else {
        parts.join(" | ")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::orderflow::{DomAnalysis, Sweeps, VolumeDelta};

    fn report(delta_ratio: f64, imbalance: f64, sweep: Option<SweepSide>) -> OrderflowReport {
        OrderflowReport {
            dom: Some(DomAnalysis {
                imbalance_ratio: imbalance,
                ..DomAnalysis::default()
            }),
            volume_delta: Some(VolumeDelta {
                delta_ratio,
                ..VolumeDelta::default()
            }),
            sweeps: Some(Sweeps {
                last_sweep_side: sweep,
                last_sweep_time: sweep.map(|_| 1_000),
                ..Sweeps::default()
            }),
            ..OrderflowReport::default()
        }
    }

    #[test]
    fn strong_buy_flow_is_long() {
        let signal =
            compute_microstructure_signal(&report(0.5, 0.7, Some(SweepSide::Bid)), &MicrostructureSettings::default());
        assert_eq!(signal.direction, SignalDirection::Long);
        assert!(signal.confidence > 0.5);
        assert!(signal.score <= 1.0);
        assert!(!signal.sweep_only);
    }

    #[test]
    fn strong_sell_flow_is_short() {
        let signal = compute_microstructure_signal(
            &report(-0.5, 0.3, Some(SweepSide::Ask)),
            &MicrostructureSettings::default(),
        );
        assert_eq!(signal.direction, SignalDirection::Short);
        assert!(signal.score < 0.0);
    }

    #[test]
    fn neutral_inputs_give_none() {
        let signal =
            compute_microstructure_signal(&report(0.05, 0.52, None), &MicrostructureSettings::default());
        assert_eq!(signal.direction, SignalDirection::None);
        assert_eq!(signal.score, 0.0);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn contribution_bounds_respected() {
        let signal =
            compute_microstructure_signal(&report(1.0, 1.0, Some(SweepSide::Bid)), &MicrostructureSettings::default());
        assert!(signal.delta_contribution <= 0.4);
        assert!(signal.imbalance_contribution <= 0.3);
        assert!((signal.sweep_contribution - 0.3).abs() < 1e-9);
        assert!(signal.score <= 1.0);
    }

    #[test]
    fn sweep_only_flagged() {
        let signal =
            compute_microstructure_signal(&report(0.0, 0.5, Some(SweepSide::Bid)), &MicrostructureSettings::default());
        assert!(signal.sweep_only);
        assert_eq!(signal.direction, SignalDirection::Long); // 0.3 >= 0.25
    }

    #[test]
    fn sweep_direction_signs() {
        let bid = compute_microstructure_signal(&report(0.0, 0.5, Some(SweepSide::Bid)), &MicrostructureSettings::default());
        assert!(bid.sweep_contribution > 0.0);
        let ask = compute_microstructure_signal(&report(0.0, 0.5, Some(SweepSide::Ask)), &MicrostructureSettings::default());
        assert!(ask.sweep_contribution < 0.0);
        assert_eq!(ask.direction, SignalDirection::Short);
    }
}
