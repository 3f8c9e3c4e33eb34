use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One strategy instance from the bot's TOML file.
///
/// ```toml
/// [[strategies]]
/// type = "rsi_mean_reversion"
/// name = "rsi_mean_reversion"
/// symbols = ["AAPL", "MSFT"]
///
/// [strategies.params]
/// period = 14
/// oversold = 30.0
/// overbought = 70.0
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Strategy type identifier, see `registry::build_strategy`.
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Instance name. Capital allocation and position ownership are keyed by it.
    pub name: String,
    /// Symbols to scan. Empty means the bot-wide symbol list.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Indicator and sizing parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl StrategyConfig {
    pub fn new(strategy_type: impl Into<String>, name: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            strategy_type: strategy_type.into(),
            name: name.into(),
            symbols,
            enabled: true,
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Float parameter; integer literals are accepted too.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        match self.params.get(key) {
            Some(toml::Value::Float(f)) => *f,
            Some(toml::Value::Integer(i)) => *i as f64,
            _ => default,
        }
    }

    pub fn param_usize(&self, key: &str, default: usize) -> usize {
        self.params
            .get(key)
            .and_then(|v| v.as_integer())
            .filter(|v| *v >= 0)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategy_table() {
        let cfg: StrategyConfig = toml::from_str(
            r#"
            type = "bollinger_bounce"
            name = "bb"
            symbols = ["SPY"]

            [params]
            period = 20
            std_dev = 2
            allow_fractional = true
            "#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.param_usize("period", 10), 20);
        assert_eq!(cfg.param_f64("std_dev", 1.0), 2.0);
        assert!(cfg.param_bool("allow_fractional", false));
        assert_eq!(cfg.param_f64("missing", 1.5), 1.5);
    }

    #[test]
    fn negative_integers_fall_back_to_default() {
        let cfg = StrategyConfig::new("rsi_mean_reversion", "rsi", vec![]).with_param("period", -3);
        assert_eq!(cfg.param_usize("period", 14), 14);
    }
}
