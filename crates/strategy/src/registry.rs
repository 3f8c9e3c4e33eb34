use std::collections::HashSet;

use tracing::info;

use common::{Error, Result};

use crate::config::StrategyConfig;
use crate::strategies::{BollingerBounce, BreakoutMomentum, MaCrossover, RsiMeanReversion};
use crate::Strategy;

/// Holds the strategy instances built from config.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Build every enabled strategy. Strategies without their own symbol
    /// list scan `default_symbols`. Unknown types, invalid parameters and
    /// duplicate names are configuration errors.
    pub fn from_config(configs: &[StrategyConfig], default_symbols: &[String]) -> Result<Self> {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        let mut seen = HashSet::new();

        for cfg in configs.iter().filter(|c| c.enabled) {
            if !seen.insert(cfg.name.clone()) {
                return Err(Error::Config(format!("duplicate strategy name '{}'", cfg.name)));
            }
            let mut cfg = cfg.clone();
            if cfg.symbols.is_empty() {
                cfg.symbols = default_symbols.to_vec();
            }
            let strategy = build_strategy(&cfg)?;
            info!(name = %strategy.name(), symbols = ?strategy.symbols(), "Registered strategy");
            strategies.push(strategy);
        }

        if strategies.is_empty() {
            return Err(Error::Config("no enabled strategies configured".into()));
        }
        Ok(Self { strategies })
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// Union of all scanned symbols, in first-seen order.
    pub fn symbols(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.strategies
            .iter()
            .flat_map(|s| s.symbols().iter())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn into_strategies(self) -> Vec<Box<dyn Strategy>> {
        self.strategies
    }
}

// ─── Strategy builders ────────────────────────────────────────────────────────

pub fn build_strategy(cfg: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    match cfg.strategy_type.as_str() {
        MaCrossover::TYPE => Ok(Box::new(MaCrossover::from_config(cfg)?)),
        BollingerBounce::TYPE => Ok(Box::new(BollingerBounce::from_config(cfg)?)),
        RsiMeanReversion::TYPE => Ok(Box::new(RsiMeanReversion::from_config(cfg)?)),
        BreakoutMomentum::TYPE => Ok(Box::new(BreakoutMomentum::from_config(cfg)?)),
        other => Err(Error::Config(format!(
            "unknown strategy type '{other}' for '{}'",
            cfg.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> Vec<String> {
        vec!["SPY".into(), "AAPL".into()]
    }

    #[test]
    fn builds_all_known_types_with_default_symbols() {
        let configs = vec![
            StrategyConfig::new("ma_crossover", "ma", vec![]),
            StrategyConfig::new("bollinger_bounce", "bb", vec!["QQQ".into()]),
            StrategyConfig::new("rsi_mean_reversion", "rsi", vec![]),
            StrategyConfig::new("breakout_momentum", "bo", vec![]),
        ];
        let registry = StrategyRegistry::from_config(&configs, &symbols()).unwrap();
        assert_eq!(registry.names(), vec!["ma", "bb", "rsi", "bo"]);
        assert_eq!(registry.symbols(), vec!["SPY", "AAPL", "QQQ"]);
    }

    #[test]
    fn skips_disabled_strategies() {
        let mut off = StrategyConfig::new("ma_crossover", "ma", vec![]);
        off.enabled = false;
        let configs = vec![off, StrategyConfig::new("rsi_mean_reversion", "rsi", vec![])];
        let registry = StrategyRegistry::from_config(&configs, &symbols()).unwrap();
        assert_eq!(registry.names(), vec!["rsi"]);
    }

    #[test]
    fn rejects_unknown_and_duplicate_entries() {
        let unknown = vec![StrategyConfig::new("macd", "m", vec![])];
        assert!(matches!(
            StrategyRegistry::from_config(&unknown, &symbols()),
            Err(Error::Config(_))
        ));

        let dupes = vec![
            StrategyConfig::new("rsi_mean_reversion", "x", vec![]),
            StrategyConfig::new("ma_crossover", "x", vec![]),
        ];
        assert!(StrategyRegistry::from_config(&dupes, &symbols()).is_err());
        assert!(StrategyRegistry::from_config(&[], &symbols()).is_err());
    }

    #[test]
    fn invalid_params_surface_as_config_errors() {
        let cfg = StrategyConfig::new("ma_crossover", "ma", vec![])
            .with_param("fast", 50)
            .with_param("slow", 20);
        assert!(build_strategy(&cfg).is_err());
    }
}
