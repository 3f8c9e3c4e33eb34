use crate::{Error, Result, TradingMode};

/// API credentials for one broker.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    /// Overrides the broker's default trading endpoint.
    pub base_url: Option<String>,
    /// Overrides the broker's default market data endpoint.
    pub data_url: Option<String>,
}

/// Secrets and deployment switches loaded from the environment at startup.
///
/// Strategy, risk and orchestration settings live in the bot's TOML file;
/// this only carries what must not be committed to a config file.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub trading_mode: TradingMode,
    pub alpaca: Option<Credentials>,
    pub coinbase: Option<Credentials>,
}

impl EnvConfig {
    /// Load from environment variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trading_mode = match lookup("TRADING_MODE")
            .unwrap_or_else(|| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => {
                return Err(Error::Config(format!(
                    "TRADING_MODE must be 'paper' or 'live', got: '{other}'"
                )))
            }
        };

        let alpaca = credentials(&lookup, "ALPACA_API_KEY", "ALPACA_SECRET_KEY").map(|mut c| {
            c.base_url = non_empty(lookup("ALPACA_BASE_URL"));
            c.data_url = non_empty(lookup("ALPACA_DATA_URL"));
            c
        });
        let coinbase = credentials(&lookup, "COINBASE_API_KEY", "COINBASE_API_SECRET").map(|mut c| {
            c.base_url = non_empty(lookup("COINBASE_BASE_URL"));
            c
        });

        Ok(EnvConfig {
            trading_mode,
            alpaca,
            coinbase,
        })
    }

    pub fn alpaca(&self) -> Result<&Credentials> {
        self.alpaca.as_ref().ok_or_else(|| {
            Error::Config("ALPACA_API_KEY and ALPACA_SECRET_KEY must be set for the alpaca broker".into())
        })
    }

    pub fn coinbase(&self) -> Result<&Credentials> {
        self.coinbase.as_ref().ok_or_else(|| {
            Error::Config(
                "COINBASE_API_KEY and COINBASE_API_SECRET must be set for the coinbase broker".into(),
            )
        })
    }
}

fn credentials<F>(lookup: &F, key_var: &str, secret_var: &str) -> Option<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = non_empty(lookup(key_var))?;
    let secret = non_empty(lookup(secret_var))?;
    Some(Credentials {
        api_key,
        secret,
        base_url: None,
        data_url: None,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_to_paper_without_credentials() {
        let cfg = EnvConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paper);
        assert!(cfg.alpaca.is_none());
        assert!(matches!(cfg.alpaca(), Err(Error::Config(_))));
    }

    #[test]
    fn reads_alpaca_credentials_and_urls() {
        let cfg = EnvConfig::from_lookup(lookup(&[
            ("TRADING_MODE", "LIVE"),
            ("ALPACA_API_KEY", "key"),
            ("ALPACA_SECRET_KEY", "secret"),
            ("ALPACA_BASE_URL", "https://api.alpaca.markets"),
        ]))
        .unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        let creds = cfg.alpaca().unwrap();
        assert_eq!(creds.api_key, "key");
        assert_eq!(creds.base_url.as_deref(), Some("https://api.alpaca.markets"));
        assert!(creds.data_url.is_none());
    }

    #[test]
    fn half_set_credentials_are_ignored() {
        let cfg = EnvConfig::from_lookup(lookup(&[("COINBASE_API_KEY", "k")])).unwrap();
        assert!(cfg.coinbase.is_none());
    }

    #[test]
    fn rejects_unknown_trading_mode() {
        let err = EnvConfig::from_lookup(lookup(&[("TRADING_MODE", "yolo")])).unwrap_err();
        assert!(err.to_string().contains("yolo"));
    }
}
