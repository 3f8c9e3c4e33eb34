use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::{Error, Result};
use orchestrator::OrchestratorConfig;
use regime::RegimeConfig;
use risk::RiskConfig;
use strategy::StrategyConfig;

/// Which broker the bot trades through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-memory simulation; bars come from Alpaca or Coinbase if credentials exist.
    #[default]
    Paper,
    Alpaca,
    Coinbase,
}

/// `[bot]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub name: String,
    pub broker: BrokerKind,
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
    pub fill_timeout_secs: u64,
    pub fill_poll_interval_ms: u64,
    /// Defaults to `<name>_bot_state.json` in the working directory.
    pub state_path: Option<PathBuf>,
    pub paper_starting_cash: f64,
    pub paper_slippage_bps: f64,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            name: "tradebot".into(),
            broker: BrokerKind::default(),
            poll_interval_secs: 300,
            error_backoff_secs: 60,
            fill_timeout_secs: 15,
            fill_poll_interval_ms: 500,
            state_path: None,
            paper_starting_cash: 100_000.0,
            paper_slippage_bps: 5.0,
        }
    }
}

impl BotSettings {
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_bot_state.json", self.name)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }
}

/// `[strategy]` section: the default universe and history depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseSettings {
    pub symbols: Vec<String>,
    /// Daily bars fetched per symbol each cycle.
    pub lookback_bars: usize,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            lookback_bars: 200,
        }
    }
}

/// Full bot configuration, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot: BotSettings,
    pub strategy: UniverseSettings,
    pub risk_management: RiskConfig,
    pub orchestrator: OrchestratorConfig,
    pub regime: RegimeConfig,
    pub strategies: Vec<StrategyConfig>,
}

impl BotConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: BotConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy.symbols.is_empty() && self.strategies.iter().all(|s| s.symbols.is_empty()) {
            return Err(Error::Config("strategy.symbols must list at least one symbol".into()));
        }
        if self.strategy.lookback_bars < 2 {
            return Err(Error::Config("strategy.lookback_bars must be at least 2".into()));
        }
        if self.strategies.iter().all(|s| !s.enabled) {
            return Err(Error::Config("at least one [[strategies]] entry must be enabled".into()));
        }
        if self.bot.poll_interval_secs == 0 {
            return Err(Error::Config("bot.poll_interval_secs must be positive".into()));
        }
        if self.bot.broker == BrokerKind::Paper && self.bot.paper_starting_cash <= 0.0 {
            return Err(Error::Config("bot.paper_starting_cash must be positive".into()));
        }
        if !self.orchestrator.capital_allocation.is_empty() {
            self.orchestrator.capital_allocation.validate()?;
        }
        self.risk_management.validate()
    }
}
