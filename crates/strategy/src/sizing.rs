use common::{Account, Bar, Position, Signal};

use crate::config::StrategyConfig;
use crate::indicators;

/// Stop distance as a fraction of price when ATR cannot be computed.
pub const FALLBACK_STOP_PCT: f64 = 0.02;

/// Per-strategy sizing and bracket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    /// Fraction of (virtual) equity risked between entry and stop.
    pub risk_per_trade: f64,
    pub atr_period: usize,
    pub atr_stop_multiple: f64,
    /// Take-profit distance as a multiple of the stop distance.
    pub reward_risk: f64,
    /// Whether position sizes may be fractional (crypto) or whole units (equities).
    pub allow_fractional: bool,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.01,
            atr_period: 14,
            atr_stop_multiple: 2.0,
            reward_risk: 2.0,
            allow_fractional: false,
        }
    }
}

/// Stop loss and take profit around an entry price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_distance: f64,
}

impl RiskParams {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        let d = Self::default();
        Self {
            risk_per_trade: cfg.param_f64("risk_per_trade", d.risk_per_trade),
            atr_period: cfg.param_usize("atr_period", d.atr_period),
            atr_stop_multiple: cfg.param_f64("atr_stop_multiple", d.atr_stop_multiple),
            reward_risk: cfg.param_f64("reward_risk", d.reward_risk),
            allow_fractional: cfg.param_bool("allow_fractional", d.allow_fractional),
        }
    }

    /// Long bracket from the ATR of `bars`, falling back to a fixed
    /// percentage of price when ATR is unavailable.
    pub fn bracket(&self, bars: &[Bar], price: f64) -> Bracket {
        let stop_distance = indicators::atr(bars, self.atr_period)
            .map(|atr| atr * self.atr_stop_multiple)
            .filter(|d| *d > 0.0 && *d < price)
            .unwrap_or(price * FALLBACK_STOP_PCT);
        Bracket {
            stop_loss: price - stop_distance,
            take_profit: price + stop_distance * self.reward_risk,
            stop_distance,
        }
    }

    /// Units to buy so that hitting the stop loses `risk_per_trade` of
    /// equity, capped by buying power.
    pub fn position_size(&self, account: &Account, price: f64, stop_distance: f64) -> f64 {
        if price <= 0.0 || stop_distance <= 0.0 || account.equity <= 0.0 {
            return 0.0;
        }
        let by_risk = account.equity * self.risk_per_trade / stop_distance;
        let by_cash = account.buying_power.max(0.0) / price;
        let size = by_risk.min(by_cash);
        if self.allow_fractional {
            size
        } else {
            size.floor()
        }
    }

    /// A sized BUY with bracket prices, or `None` when the account cannot
    /// afford a single unit.
    pub fn entry_signal(
        &self,
        symbol: &str,
        bars: &[Bar],
        account: &Account,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Option<Signal> {
        let bar = bars.last()?;
        let price = bar.close;
        let bracket = self.bracket(bars, price);
        let size = self.position_size(account, price, bracket.stop_distance);
        if size <= 0.0 {
            return None;
        }
        Some(
            Signal::buy(symbol, price, confidence, reason)
                .with_stop_loss(bracket.stop_loss)
                .with_take_profit(bracket.take_profit)
                .with_position_size(size)
                .with_timestamp(bar.timestamp),
        )
    }
}

/// A SELL closing the whole of `position`.
pub fn exit_signal(position: &Position, bars: &[Bar], confidence: f64, reason: impl Into<String>) -> Option<Signal> {
    let bar = bars.last()?;
    Some(
        Signal::sell(&position.symbol, bar.close, confidence, reason)
            .with_position_size(position.quantity)
            .with_timestamp(bar.timestamp),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::bars_from_closes;

    fn account(equity: f64, buying_power: f64) -> Account {
        Account {
            equity,
            cash: buying_power,
            buying_power,
            portfolio_value: equity,
            positions_count: 0,
        }
    }

    #[test]
    fn bracket_uses_atr_multiple() {
        // Constant closes with ±1 spread → every TR = 2
        let bars = bars_from_closes(&[100.0; 20], 1.0);
        let b = RiskParams::default().bracket(&bars, 100.0);
        assert_eq!(b.stop_distance, 4.0);
        assert_eq!(b.stop_loss, 96.0);
        assert_eq!(b.take_profit, 108.0);
    }

    #[test]
    fn bracket_falls_back_without_atr() {
        let bars = bars_from_closes(&[50.0; 3], 1.0);
        let b = RiskParams::default().bracket(&bars, 50.0);
        assert!((b.stop_distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn size_is_risk_based_and_capped_by_buying_power() {
        let p = RiskParams::default();
        // 1% of 100k = 1000 risk / 4 per share = 250 shares
        assert_eq!(p.position_size(&account(100_000.0, 100_000.0), 100.0, 4.0), 250.0);
        // Buying power only covers 50 shares
        assert_eq!(p.position_size(&account(100_000.0, 5_000.0), 100.0, 4.0), 50.0);
        assert_eq!(p.position_size(&account(0.0, 0.0), 100.0, 4.0), 0.0);
    }

    #[test]
    fn fractional_sizes_are_kept_when_allowed() {
        let p = RiskParams { allow_fractional: true, ..RiskParams::default() };
        let size = p.position_size(&account(1_000.0, 1_000.0), 30_000.0, 600.0);
        assert!((size - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn entry_signal_skips_unaffordable_trades() {
        let bars = bars_from_closes(&[100.0; 20], 1.0);
        let p = RiskParams::default();
        assert!(p.entry_signal("SPY", &bars, &account(50.0, 50.0), 0.7, "x").is_none());
        let s = p.entry_signal("SPY", &bars, &account(100_000.0, 100_000.0), 0.7, "x").unwrap();
        assert_eq!(s.position_size, Some(250.0));
        assert_eq!(s.stop_loss, Some(96.0));
    }
}
