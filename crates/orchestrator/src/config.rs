use serde::{Deserialize, Serialize};

use common::CapitalAllocation;

/// How BUY and SELL signals for the same symbol in one cycle are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the single most confident signal per symbol; ties go to SELL.
    #[default]
    HighestConfidence,
    /// Let both directions through.
    PassThrough,
}

/// `[orchestrator]` section of the bot config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Strategy name → fraction of equity. Empty means equal weight.
    pub capital_allocation: CapitalAllocation,
    pub enable_regime_detection: bool,
    /// Symbol the regime is read from; falls back to the first symbol with data.
    pub reference_symbol: String,
    pub enable_risk_manager: bool,
    pub conflict_policy: ConflictPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capital_allocation: CapitalAllocation::default(),
            enable_regime_detection: false,
            reference_symbol: "SPY".into(),
            enable_risk_manager: true,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}
