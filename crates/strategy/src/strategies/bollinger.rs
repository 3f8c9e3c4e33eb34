use common::{Account, Error, MarketData, Position, Result, Signal};

use crate::config::StrategyConfig;
use crate::indicators::bollinger;
use crate::sizing::{exit_signal, RiskParams};
use crate::{scan_symbols, Strategy};

/// Mean reversion off the Bollinger bands: buy a close at or under the
/// lower band, exit once price is back at the middle band.
#[derive(Debug, Clone)]
pub struct BollingerBounce {
    name: String,
    symbols: Vec<String>,
    period: usize,
    num_std: f64,
    risk: RiskParams,
}

impl BollingerBounce {
    pub const TYPE: &'static str = "bollinger_bounce";

    pub fn new(name: impl Into<String>, symbols: Vec<String>, period: usize, num_std: f64, risk: RiskParams) -> Result<Self> {
        if period < 2 || num_std <= 0.0 {
            return Err(Error::Config(format!(
                "bollinger_bounce needs period >= 2 and std_dev > 0, got {period} / {num_std}"
            )));
        }
        Ok(Self {
            name: name.into(),
            symbols,
            period,
            num_std,
            risk,
        })
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self> {
        Self::new(
            cfg.name.clone(),
            cfg.symbols.clone(),
            cfg.param_usize("period", 20),
            cfg.param_f64("std_dev", 2.0),
            RiskParams::from_config(cfg),
        )
    }
}

impl Strategy for BollingerBounce {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        Self::TYPE
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn generate_signals(&self, data: &MarketData, account: &Account, positions: &[Position]) -> Vec<Signal> {
        scan_symbols(&self.symbols, data, positions, |symbol, bars, held| {
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let bands = bollinger(&closes, self.period, self.num_std)?;
            let price = *closes.last()?;
            let width = bands.upper - bands.lower;

            match held {
                None if price <= bands.lower && width > 0.0 => {
                    let depth = (bands.lower - price) / width;
                    self.risk
                        .entry_signal(
                            symbol,
                            bars,
                            account,
                            (0.6 + depth).min(0.95),
                            format!("close {price:.2} at/below lower band {:.2}", bands.lower),
                        )
                        .map(|s| {
                            s.with_metadata("bb_lower", bands.lower)
                                .with_metadata("bb_middle", bands.middle)
                        })
                }
                Some(position) if price >= bands.middle => {
                    let confidence = if price >= bands.upper { 0.9 } else { 0.7 };
                    exit_signal(
                        position,
                        bars,
                        confidence,
                        format!("close {price:.2} reverted to middle band {:.2}", bands.middle),
                    )
                }
                _ => None,
            }
        })
    }
}
