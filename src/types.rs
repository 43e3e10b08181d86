// =============================================================================
// Shared types used across the Borealis engine
// =============================================================================
//
// Every closed set in the engine (timeframes, phases, trend directions,
// regimes, exit reasons, ...) is a real enum so that the state machines stay
// exhaustively checkable. String forms match the Bybit wire / archive values.
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Bybit kline interval buckets. `Mn1` (calendar month) has no fixed
/// millisecond duration; durable arithmetic must not assume one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
    Mn1,
}

/// Threshold profile bucket: short TFs are noisier, long TFs smoother.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfProfile {
    Short,
    Long,
}

impl Timeframe {
    pub const ALL: [Timeframe; 13] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H12,
        Self::D1,
        Self::W1,
        Self::Mn1,
    ];

    /// Bybit V5 interval code ("1", "3", ..., "720", "D", "W", "M").
    /// Also the value stored in the `klines.timeframe` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M3 => "3",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::M30 => "30",
            Self::H1 => "60",
            Self::H2 => "120",
            Self::H4 => "240",
            Self::H6 => "360",
            Self::H12 => "720",
            Self::D1 => "D",
            Self::W1 => "W",
            Self::Mn1 => "M",
        }
    }

    /// Parse a Bybit interval code. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "1" => Some(Self::M1),
            "3" => Some(Self::M3),
            "5" => Some(Self::M5),
            "15" => Some(Self::M15),
            "30" => Some(Self::M30),
            "60" => Some(Self::H1),
            "120" => Some(Self::H2),
            "240" => Some(Self::H4),
            "360" => Some(Self::H6),
            "720" => Some(Self::H12),
            "D" => Some(Self::D1),
            "W" => Some(Self::W1),
            "M" => Some(Self::Mn1),
            _ => None,
        }
    }

    /// Bucket duration in milliseconds. `None` for the calendar month.
    pub fn duration_ms(self) -> Option<i64> {
        match self {
            Self::M1 => Some(60_000),
            Self::M3 => Some(180_000),
            Self::M5 => Some(300_000),
            Self::M15 => Some(900_000),
            Self::M30 => Some(1_800_000),
            Self::H1 => Some(3_600_000),
            Self::H2 => Some(7_200_000),
            Self::H4 => Some(14_400_000),
            Self::H6 => Some(21_600_000),
            Self::H12 => Some(43_200_000),
            Self::D1 => Some(86_400_000),
            Self::W1 => Some(604_800_000),
            Self::Mn1 => None,
        }
    }

    /// Threshold profile: minutes up to 30 are Short, everything else Long.
    pub fn profile(self) -> TfProfile {
        match self {
            Self::M1 | Self::M3 | Self::M5 | Self::M15 | Self::M30 => TfProfile::Short,
            _ => TfProfile::Long,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market classification enums
// ---------------------------------------------------------------------------

/// Six market phases (Wyckoff scheme plus capitulation and recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Accumulation,
    Markup,
    Distribution,
    Markdown,
    Capitulation,
    Recovery,
}

impl Phase {
    /// Phases after which price usually rises. Capitulation counts as
    /// bullish: it marks a bottoming zone where a bounce is expected.
    pub fn is_bullish(self) -> bool {
        matches!(self, Self::Markup | Self::Recovery | Self::Capitulation)
    }

    pub fn is_bearish(self) -> bool {
        matches!(self, Self::Markdown | Self::Distribution)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accumulation => "accumulation",
            Self::Markup => "markup",
            Self::Distribution => "distribution",
            Self::Markdown => "markdown",
            Self::Capitulation => "capitulation",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trend direction from the evidence-scoring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl TrendDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Flat => "flat",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse market regime used as a gating variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trend,
    Range,
    Surge,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trend => write!(f, "trend"),
            Self::Range => write!(f, "range"),
            Self::Surge => write!(f, "surge"),
        }
    }
}

/// Price structure over the analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    Up,
    Down,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MomentumDirection {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MomentumState {
    Strong,
    Fading,
    Flat,
}

// ---------------------------------------------------------------------------
// Order flow / signal enums
// ---------------------------------------------------------------------------

/// Side of a swept level: bid = lower wick through support, ask = upper
/// wick through resistance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Long,
    Short,
    None,
}

impl SignalDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sandbox enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Flat,
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Normalized close reason, stored on every close row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    Breakeven,
    TakeProfit,
    TakeProfitPart,
    TrailingStop,
    Microstructure,
    Liquidation,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::Breakeven => "breakeven",
            Self::TakeProfit => "take_profit",
            Self::TakeProfitPart => "take_profit_part",
            Self::TrailingStop => "trailing_stop",
            Self::Microstructure => "microstructure",
            Self::Liquidation => "liquidation",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What produced the entry, stored on every open row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Microstructure,
    ContextNowPrimary,
    ContextNowOnly,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Microstructure => "microstructure",
            Self::ContextNowPrimary => "context_now_primary",
            Self::ContextNowOnly => "context_now_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Open,
    Close,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// Whether a sandbox run replays history or follows the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunSource {
    Backtest,
    Live,
}

impl RunSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backtest => "backtest",
            Self::Live => "live",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
        assert_eq!(Timeframe::parse("7"), None);
        assert_eq!(Timeframe::parse(" d "), Some(Timeframe::D1));
    }

    #[test]
    fn timeframe_ordering_follows_duration() {
        let mut sorted = Timeframe::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted.first(), Some(&Timeframe::M1));
        assert_eq!(sorted.last(), Some(&Timeframe::Mn1));
        assert!(Timeframe::M15 < Timeframe::H4);
    }

    #[test]
    fn month_has_no_fixed_duration() {
        assert_eq!(Timeframe::Mn1.duration_ms(), None);
        for tf in Timeframe::ALL.iter().filter(|t| **t != Timeframe::Mn1) {
            assert!(tf.duration_ms().is_some());
        }
    }

    #[test]
    fn profiles_split_at_30_minutes() {
        assert_eq!(Timeframe::M30.profile(), TfProfile::Short);
        assert_eq!(Timeframe::H1.profile(), TfProfile::Long);
        assert_eq!(Timeframe::Mn1.profile(), TfProfile::Long);
    }

    #[test]
    fn phase_bias_sets() {
        assert!(Phase::Capitulation.is_bullish());
        assert!(Phase::Distribution.is_bearish());
        assert!(!Phase::Accumulation.is_bullish());
        assert!(!Phase::Accumulation.is_bearish());
    }

    #[test]
    fn exit_reason_strings() {
        assert_eq!(ExitReason::TakeProfitPart.as_str(), "take_profit_part");
        assert_eq!(ExitReason::Liquidation.to_string(), "liquidation");
    }
}
