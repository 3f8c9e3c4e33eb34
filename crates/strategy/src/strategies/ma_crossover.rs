use common::{Account, Error, MarketData, Position, Result, Signal};

use crate::config::StrategyConfig;
use crate::indicators::sma;
use crate::sizing::{exit_signal, RiskParams};
use crate::{scan_symbols, Strategy};

/// Trend follower: enters when the fast SMA crosses above the slow SMA
/// and exits on the opposite cross.
#[derive(Debug, Clone)]
pub struct MaCrossover {
    name: String,
    symbols: Vec<String>,
    fast: usize,
    slow: usize,
    risk: RiskParams,
}

impl MaCrossover {
    pub const TYPE: &'static str = "ma_crossover";

    pub fn new(name: impl Into<String>, symbols: Vec<String>, fast: usize, slow: usize, risk: RiskParams) -> Result<Self> {
        if fast == 0 || fast >= slow {
            return Err(Error::Config(format!(
                "ma_crossover fast period ({fast}) must be positive and below slow period ({slow})"
            )));
        }
        Ok(Self {
            name: name.into(),
            symbols,
            fast,
            slow,
            risk,
        })
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self> {
        Self::new(
            cfg.name.clone(),
            cfg.symbols.clone(),
            cfg.param_usize("fast", 20),
            cfg.param_usize("slow", 50),
            RiskParams::from_config(cfg),
        )
    }
}

impl Strategy for MaCrossover {
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
            if closes.len() < self.slow + 1 {
                return None;
            }
            let prev = &closes[..closes.len() - 1];
            let (fast_now, slow_now) = (sma(&closes, self.fast)?, sma(&closes, self.slow)?);
            let (fast_prev, slow_prev) = (sma(prev, self.fast)?, sma(prev, self.slow)?);

            let spread = (fast_now - slow_now).abs() / slow_now;
            let confidence = (0.6 + spread * 10.0).min(0.95);

            match held {
                None if fast_prev <= slow_prev && fast_now > slow_now => self
                    .risk
                    .entry_signal(
                        symbol,
                        bars,
                        account,
                        confidence,
                        format!("SMA{} crossed above SMA{}", self.fast, self.slow),
                    )
                    .map(|s| s.with_metadata("fast_ma", fast_now).with_metadata("slow_ma", slow_now)),
                Some(position) if fast_prev >= slow_prev && fast_now < slow_now => exit_signal(
                    position,
                    bars,
                    confidence,
                    format!("SMA{} crossed below SMA{}", self.fast, self.slow),
                ),
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

    fn strategy() -> MaCrossover {
        MaCrossover::new("ma", vec!["SPY".into()], 3, 6, RiskParams::default()).unwrap()
    }

    #[test]
    fn rejects_inverted_periods() {
        assert!(MaCrossover::new("ma", vec![], 10, 5, RiskParams::default()).is_err());
    }

    #[test]
    fn buys_on_golden_cross() {
        // Falling, then a sharp jump on the last bar pulls SMA3 above SMA6
        let closes = [110.0, 108.0, 106.0, 104.0, 102.0, 100.0, 98.0, 130.0];
        let signals = strategy().generate_signals(&data("SPY", &closes), &account(), &[]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        assert!(signals[0].position_size.unwrap() > 0.0);
        assert!(signals[0].stop_loss.unwrap() < 130.0);
    }

    #[test]
    fn sells_held_position_on_death_cross() {
        let closes = [90.0, 92.0, 94.0, 96.0, 98.0, 100.0, 102.0, 70.0];
        let positions = held("SPY", 10.0, 95.0);
        let signals = strategy().generate_signals(&data("SPY", &closes), &account(), &positions);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Sell);
        assert_eq!(signals[0].position_size, Some(10.0));
    }

    #[test]
    fn no_signal_without_cross_or_data() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert!(strategy().generate_signals(&data("SPY", &rising), &account(), &[]).is_empty());
        assert!(strategy().generate_signals(&data("QQQ", &rising), &account(), &[]).is_empty());
    }
}
