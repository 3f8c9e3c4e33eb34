use common::{Account, Error, MarketData, Position, Result, Signal};

use crate::config::StrategyConfig;
use crate::indicators::{highest_high, lowest_low};
use crate::sizing::{exit_signal, RiskParams};
use crate::{scan_symbols, Strategy};

/// Donchian-style breakout confirmed by volume. Exits when price loses
/// the shorter exit channel.
#[derive(Debug, Clone)]
pub struct BreakoutMomentum {
    name: String,
    symbols: Vec<String>,
    lookback: usize,
    exit_lookback: usize,
    volume_multiple: f64,
    risk: RiskParams,
}

impl BreakoutMomentum {
    pub const TYPE: &'static str = "breakout_momentum";

    pub fn new(
        name: impl Into<String>,
        symbols: Vec<String>,
        lookback: usize,
        exit_lookback: usize,
        volume_multiple: f64,
        risk: RiskParams,
    ) -> Result<Self> {
        if lookback == 0 || exit_lookback == 0 {
            return Err(Error::Config("breakout_momentum lookbacks must be positive".into()));
        }
        Ok(Self {
            name: name.into(),
            symbols,
            lookback,
            exit_lookback,
            volume_multiple,
            risk,
        })
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self> {
        Self::new(
            cfg.name.clone(),
            cfg.symbols.clone(),
            cfg.param_usize("lookback", 20),
            cfg.param_usize("exit_lookback", 10),
            cfg.param_f64("volume_multiple", 1.5),
            RiskParams::from_config(cfg),
        )
    }
}

impl Strategy for BreakoutMomentum {
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
            let (last, history) = bars.split_last()?;

            match held {
                None => {
                    if history.len() < self.lookback {
                        return None;
                    }
                    let window = &history[history.len() - self.lookback..];
                    let channel_high = highest_high(window)?;
                    let avg_volume = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
                    let volume_ok = avg_volume <= 0.0 || last.volume >= avg_volume * self.volume_multiple;
                    if last.close <= channel_high || !volume_ok {
                        return None;
                    }
                    let breakout = (last.close - channel_high) / channel_high;
                    let volume_ratio = if avg_volume > 0.0 { last.volume / avg_volume } else { 1.0 };
                    let confidence =
                        (0.55 + breakout * 5.0 + (volume_ratio - self.volume_multiple).max(0.0) * 0.1).min(0.95);
                    self.risk
                        .entry_signal(
                            symbol,
                            bars,
                            account,
                            confidence,
                            format!("close {:.2} broke {}-bar high {channel_high:.2}", last.close, self.lookback),
                        )
                        .map(|s| s.with_metadata("channel_high", channel_high).with_metadata("volume_ratio", volume_ratio))
                }
                Some(position) => {
                    if history.len() < self.exit_lookback {
                        return None;
                    }
                    let channel_low = lowest_low(&history[history.len() - self.exit_lookback..])?;
                    if last.close >= channel_low {
                        return None;
                    }
                    exit_signal(
                        position,
                        bars,
                        0.75,
                        format!("close {:.2} lost {}-bar low {channel_low:.2}", last.close, self.exit_lookback),
                    )
                }
            }
        })
    }
}
