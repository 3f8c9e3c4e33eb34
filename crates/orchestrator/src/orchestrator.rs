use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::{Account, CapitalAllocation, Error, MarketData, Position, Result, Signal, STRATEGY_KEY};
use regime::{MarketRegime, MarketRegimeDetector, RegimeConfig};
use risk::{RiskConfig, RiskManager};
use strategy::Strategy;

use crate::config::OrchestratorConfig;
use crate::conflict::resolve_conflicts;

/// Composes independent strategies into one risk-checked signal stream.
///
/// Each strategy sees a virtual account holding its allocated slice of
/// equity and only the positions tagged with its own name.
pub struct StrategyOrchestrator {
    strategies: Vec<Box<dyn Strategy>>,
    config: OrchestratorConfig,
    allocation: CapitalAllocation,
    regime: Option<MarketRegimeDetector>,
    risk_multiplier: f64,
    risk: Option<RiskManager>,
}

impl StrategyOrchestrator {
    pub fn new(
        strategies: Vec<Box<dyn Strategy>>,
        config: OrchestratorConfig,
        risk_config: RiskConfig,
        regime_config: RegimeConfig,
    ) -> Result<Self> {
        if strategies.is_empty() {
            return Err(Error::Config("orchestrator needs at least one strategy".into()));
        }
        let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();

        let allocation = if config.capital_allocation.is_empty() {
            CapitalAllocation::equal_weight(&names)
        } else {
            config.capital_allocation.validate()?;
            if let Some((unknown, _)) = config.capital_allocation.iter().find(|(n, _)| !names.contains(n)) {
                return Err(Error::Config(format!(
                    "capital_allocation names unknown strategy '{unknown}'"
                )));
            }
            for name in names.iter().filter(|n| config.capital_allocation.fraction(n) == 0.0) {
                warn!(strategy = %name, "Strategy has no capital allocation; it will only manage exits");
            }
            config.capital_allocation.clone()
        };

        let risk = if config.enable_risk_manager {
            Some(RiskManager::new(risk_config)?)
        } else {
            None
        };
        let regime = config
            .enable_regime_detection
            .then(|| MarketRegimeDetector::new(regime_config));

        info!(
            strategies = ?names,
            allocation = ?allocation,
            regime_detection = regime.is_some(),
            risk_manager = risk.is_some(),
            "StrategyOrchestrator initialised"
        );

        Ok(Self {
            strategies,
            config,
            allocation,
            regime,
            risk_multiplier: 1.0,
            risk,
        })
    }

    /// Replace the regime detector, enabling regime-driven allocation.
    pub fn with_regime_detector(mut self, detector: MarketRegimeDetector) -> Self {
        self.regime = Some(detector);
        self
    }

    pub fn allocation(&self) -> &CapitalAllocation {
        &self.allocation
    }

    pub fn risk_multiplier(&self) -> f64 {
        self.risk_multiplier
    }

    pub fn current_regime(&self) -> Option<MarketRegime> {
        self.regime.as_ref().and_then(MarketRegimeDetector::current_regime)
    }

    pub fn risk_manager(&self) -> Option<&RiskManager> {
        self.risk.as_ref()
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Every symbol any strategy scans, plus the regime reference symbol
    /// when detection is on.
    pub fn symbols(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out: Vec<String> = self
            .strategies
            .iter()
            .flat_map(|s| s.symbols().iter())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect();
        if self.regime.is_some() && !out.contains(&self.config.reference_symbol) {
            out.push(self.config.reference_symbol.clone());
        }
        out
    }

    /// Regime table mapped onto the registered strategy instances.
    ///
    /// A type's weight is split evenly across its instances, then the result
    /// is renormalised over the registered names.
    pub fn regime_allocation(&self, regime: MarketRegime) -> CapitalAllocation {
        let table = regime.allocation();
        let mut per_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for s in &self.strategies {
            *per_kind.entry(s.kind()).or_default() += 1;
        }
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        CapitalAllocation::from_pairs(
            self.strategies
                .iter()
                .map(|s| (s.name(), table.fraction(s.kind()) / per_kind[s.kind()] as f64)),
        )
        .restricted_to(&names)
    }

    /// Run one orchestration cycle and return the signals to execute.
    pub fn generate_signals(
        &mut self,
        data: &MarketData,
        account: &Account,
        positions: &[Position],
        now: DateTime<Utc>,
    ) -> Vec<Signal> {
        if let Some(risk) = self.risk.as_mut() {
            risk.check_circuit_breakers(account.equity, now.date_naive());
        }
        self.update_regime(data);
        let regime = self.current_regime();

        let mut signals = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            let fraction = self.allocation.fraction(name).max(0.0);
            let own: Vec<Position> = positions
                .iter()
                .filter(|p| p.strategy() == Some(name))
                .cloned()
                .collect();
            // Unfunded strategies still manage exits for what they already hold.
            let exits_only = fraction <= 0.0;
            if exits_only && own.is_empty() {
                debug!(strategy = %name, "Skipping strategy with zero allocation");
                continue;
            }
            let virtual_account = account.scaled(fraction);

            let produced = strategy.generate_signals(data, &virtual_account, &own);
            debug!(strategy = %name, count = produced.len(), exits_only, "Strategy produced signals");

            for signal in produced {
                if signal.signal_type == common::SignalType::Hold || (exits_only && !signal.is_sell()) {
                    continue;
                }
                let signal = signal
                    .with_metadata(STRATEGY_KEY, name)
                    .with_metadata("capital_allocation", fraction);
                if let Some(s) = self.apply_regime(signal, regime) {
                    signals.push(s);
                }
            }
        }

        let generated = signals.len();
        let resolved = resolve_conflicts(signals, self.config.conflict_policy);
        let resolved_count = resolved.len();

        let accepted = match &self.risk {
            Some(risk) => risk.validate_batch(resolved, account, positions, data),
            None => resolved,
        };

        info!(
            generated,
            after_conflicts = resolved_count,
            accepted = accepted.len(),
            regime = ?regime,
            "Orchestration cycle complete"
        );
        accepted
    }

    /// Count an executed entry against the daily trade limit.
    pub fn record_execution(&mut self, signal: &Signal) {
        if let (Some(risk), true) = (self.risk.as_mut(), signal.is_buy()) {
            risk.record_trade();
        }
    }

    fn update_regime(&mut self, data: &MarketData) {
        let Some(detector) = self.regime.as_mut() else {
            return;
        };
        let reference = if data.contains(&self.config.reference_symbol) {
            Some(self.config.reference_symbol.as_str())
        } else {
            data.symbols().next()
        };
        let Some(bars) = reference.and_then(|s| data.bars(s)) else {
            warn!("No market data for regime detection");
            return;
        };

        match detector.detect_regime(bars, None) {
            Ok(update) if update.changed => {
                let regime = update.current;
                self.allocation = self.regime_allocation(regime);
                self.risk_multiplier = regime.risk_multiplier();
                info!(
                    regime = %regime,
                    previous = ?update.previous,
                    risk_multiplier = self.risk_multiplier,
                    allocation = ?self.allocation,
                    "Capital allocation updated for regime"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(reference = ?reference, error = %e, "Regime detection failed, keeping allocation"),
        }
    }

    /// Scale BUY sizes by the regime multiplier and record provenance.
    /// Returns `None` when scaling leaves nothing to buy.
    fn apply_regime(&self, signal: Signal, regime: Option<MarketRegime>) -> Option<Signal> {
        let Some(regime) = regime else {
            return Some(signal);
        };
        let multiplier = self.risk_multiplier;
        let mut signal = signal
            .with_metadata("regime", regime.to_string())
            .with_metadata("risk_multiplier", multiplier);

        if signal.is_buy() {
            if let Some(size) = signal.position_size {
                let mut scaled = size * multiplier;
                if size.fract() == 0.0 {
                    scaled = scaled.floor();
                }
                if scaled <= 0.0 {
                    debug!(symbol = %signal.symbol, size, multiplier, "Regime scaling left zero size, dropping");
                    return None;
                }
                signal = signal
                    .with_metadata("original_position_size", size)
                    .with_position_size(scaled);
            }
        }
        Some(signal)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
