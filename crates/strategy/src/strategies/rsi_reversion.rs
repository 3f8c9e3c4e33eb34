use common::{Account, Error, MarketData, Position, Result, Signal};

use crate::config::StrategyConfig;
use crate::indicators::rsi;
use crate::sizing::{exit_signal, RiskParams};
use crate::{scan_symbols, Strategy};

/// Buys oversold RSI readings and sells the position back into overbought.
#[derive(Debug, Clone)]
pub struct RsiMeanReversion {
    name: String,
    symbols: Vec<String>,
    period: usize,
    oversold: f64,
    overbought: f64,
    risk: RiskParams,
}

impl RsiMeanReversion {
    pub const TYPE: &'static str = "rsi_mean_reversion";

    pub fn new(
        name: impl Into<String>,
        symbols: Vec<String>,
        period: usize,
        oversold: f64,
        overbought: f64,
        risk: RiskParams,
    ) -> Result<Self> {
        if period < 2 {
            return Err(Error::Config(format!("RSI period must be >= 2, got {period}")));
        }
        if !(0.0 < oversold && oversold < overbought && overbought < 100.0) {
            return Err(Error::Config(format!(
                "RSI thresholds must satisfy 0 < oversold < overbought < 100, got {oversold} / {overbought}"
            )));
        }
        Ok(Self {
            name: name.into(),
            symbols,
            period,
            oversold,
            overbought,
            risk,
        })
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self> {
        Self::new(
            cfg.name.clone(),
            cfg.symbols.clone(),
            cfg.param_usize("period", 14),
            cfg.param_f64("oversold", 30.0),
            cfg.param_f64("overbought", 70.0),
            RiskParams::from_config(cfg),
        )
    }
}

impl Strategy for RsiMeanReversion {
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
            let value = rsi(&closes, self.period)?;

            match held {
                None if value <= self.oversold => {
                    let confidence = 0.5 + 0.5 * (self.oversold - value) / self.oversold;
                    self.risk
                        .entry_signal(symbol, bars, account, confidence, format!("RSI {value:.1} oversold"))
                        .map(|s| s.with_metadata("rsi", value))
                }
                Some(position) if value >= self.overbought => {
                    let confidence = 0.5 + 0.5 * (value - self.overbought) / (100.0 - self.overbought);
                    exit_signal(position, bars, confidence, format!("RSI {value:.1} overbought"))
                        .map(|s| s.with_metadata("rsi", value))
                }
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::{account, data, held};
    use common::SignalType;

    fn strategy() -> RsiMeanReversion {
        RsiMeanReversion::new("rsi", vec!["AAPL".into()], 3, 30.0, 70.0, RiskParams::default()).unwrap()
    }

    #[test]
    fn validates_thresholds() {
        assert!(RsiMeanReversion::new("rsi", vec![], 14, 70.0, 30.0, RiskParams::default()).is_err());
        assert!(RsiMeanReversion::new("rsi", vec![], 1, 30.0, 70.0, RiskParams::default()).is_err());
    }

    #[test]
    fn buys_when_oversold_with_full_confidence_at_zero() {
        let closes = [14.0, 13.0, 12.0, 11.0, 10.0];
        let signals = strategy().generate_signals(&data("AAPL", &closes), &account(), &[]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        assert!((signals[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn oversold_is_ignored_when_already_holding() {
        let closes = [14.0, 13.0, 12.0, 11.0, 10.0];
        let positions = held("AAPL", 3.0, 12.0);
        assert!(strategy().generate_signals(&data("AAPL", &closes), &account(), &positions).is_empty());
    }

    #[test]
    fn sells_held_position_when_overbought() {
        let closes = [10.0, 11.0, 12.0, 13.0, 14.0];
        let positions = held("AAPL", 3.0, 10.0);
        let signals = strategy().generate_signals(&data("AAPL", &closes), &account(), &positions);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Sell);
        assert_eq!(signals[0].position_size, Some(3.0));
    }
}
