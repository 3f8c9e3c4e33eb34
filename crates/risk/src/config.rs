use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::{Error, Result};

/// Portfolio-wide limits. Fractions are of account equity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Total open risk (entry to stop) across positions plus pending entries.
    pub max_portfolio_heat: f64,
    /// Highest tolerated return correlation between a new entry and any holding.
    pub max_position_correlation: f64,
    pub max_sector_exposure: f64,
    /// Loss from the day-start equity that trips the breaker.
    pub max_daily_loss: f64,
    /// Loss from peak equity that trips the breaker.
    pub max_drawdown: f64,
    pub max_daily_trades: u32,
    pub max_open_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_portfolio_heat: 0.10,
            max_position_correlation: 0.7,
            max_sector_exposure: 0.30,
            max_daily_loss: 0.03,
            max_drawdown: 0.10,
            max_daily_trades: 20,
            max_open_positions: 10,
        }
    }
}

/// `[risk_management]` section of the bot config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub limits: RiskLimits,
    /// Daily returns used for the correlation check.
    pub correlation_lookback_days: usize,
    /// Stop distance charged to positions and signals that carry no stop.
    pub default_stop_loss_pct: f64,
    /// Symbol → sector overrides, merged over the built-in map.
    pub sectors: BTreeMap<String, String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            correlation_lookback_days: 30,
            default_stop_loss_pct: 0.02,
            sectors: BTreeMap::new(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        let fractions = [
            ("max_portfolio_heat", l.max_portfolio_heat),
            ("max_sector_exposure", l.max_sector_exposure),
            ("max_daily_loss", l.max_daily_loss),
            ("max_drawdown", l.max_drawdown),
            ("default_stop_loss_pct", self.default_stop_loss_pct),
        ];
        for (key, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("risk_management.{key} must be in (0, 1], got {value}")));
            }
        }
        if !(-1.0..=1.0).contains(&l.max_position_correlation) {
            return Err(Error::Config(format!(
                "risk_management.max_position_correlation must be in [-1, 1], got {}",
                l.max_position_correlation
            )));
        }
        if l.max_open_positions == 0 || l.max_daily_trades == 0 {
            return Err(Error::Config(
                "risk_management position and trade limits must be positive".into(),
            ));
        }
        if self.correlation_lookback_days < 5 {
            return Err(Error::Config(format!(
                "correlation_lookback_days must be >= 5, got {}",
                self.correlation_lookback_days
            )));
        }
        Ok(())
    }
}

/// Built-in symbol → sector map for common US equities, ETFs and crypto pairs.
pub fn default_sectors() -> BTreeMap<String, String> {
    const TABLE: &[(&str, &[&str])] = &[
        (
            "technology",
            &["AAPL", "MSFT", "NVDA", "AMD", "INTC", "GOOGL", "GOOG", "META", "ORCL", "CRM", "ADBE", "AVGO", "QQQ"],
        ),
        ("consumer", &["AMZN", "TSLA", "HD", "NKE", "MCD", "SBUX", "WMT", "COST"]),
        ("financials", &["JPM", "BAC", "GS", "MS", "WFC", "V", "MA", "XLF"]),
        ("healthcare", &["JNJ", "UNH", "PFE", "MRK", "ABBV", "LLY", "XLV"]),
        ("energy", &["XOM", "CVX", "COP", "XLE"]),
        ("broad_market", &["SPY", "VOO", "IVV", "DIA", "IWM", "VTI"]),
        ("crypto", &["BTC-USD", "ETH-USD", "SOL-USD", "BTCUSD", "ETHUSD", "SOLUSD", "COIN"]),
    ];
    TABLE
        .iter()
        .flat_map(|(sector, symbols)| symbols.iter().map(move |s| (s.to_string(), sector.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_limits_with_defaults() {
        let raw = r#"
            correlation_lookback_days = 20

            [limits]
            max_portfolio_heat = 0.06
            max_daily_trades = 5

            [sectors]
            PLTR = "technology"
        "#;
        let cfg: RiskConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.limits.max_portfolio_heat, 0.06);
        assert_eq!(cfg.limits.max_daily_trades, 5);
        assert_eq!(cfg.limits.max_sector_exposure, 0.30);
        assert_eq!(cfg.correlation_lookback_days, 20);
        assert_eq!(cfg.sectors.get("PLTR").map(String::as_str), Some("technology"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_limits() {
        let mut cfg = RiskConfig::default();
        cfg.limits.max_portfolio_heat = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = RiskConfig::default();
        cfg.limits.max_position_correlation = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_sector_map_knows_common_symbols() {
        let sectors = default_sectors();
        assert_eq!(sectors.get("AAPL").map(String::as_str), Some("technology"));
        assert_eq!(sectors.get("BTC-USD").map(String::as_str), Some("crypto"));
        assert!(!sectors.contains_key("ZZZZ"));
    }
}
