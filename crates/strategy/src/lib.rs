pub mod config;
pub mod indicators;
pub mod registry;
pub mod sizing;
pub mod strategies;

pub use config::StrategyConfig;
pub use registry::{build_strategy, StrategyRegistry};
pub use sizing::RiskParams;
pub use strategies::{BollingerBounce, BreakoutMomentum, MaCrossover, RsiMeanReversion};

use common::{Account, Bar, MarketData, Position, Signal};

/// All strategy implementations must satisfy this trait.
///
/// Strategies are pure with respect to their inputs: the account they see
/// is the virtual slice the orchestrator allotted to them, and the
/// positions are only those they opened themselves.
pub trait Strategy: Send + Sync {
    /// Instance name; capital allocation and position ownership key on it.
    fn name(&self) -> &str;

    /// Strategy type, e.g. `ma_crossover`. Regime allocation tables key on it.
    fn kind(&self) -> &str;

    /// Symbols this strategy scans.
    fn symbols(&self) -> &[String];

    /// Evaluate the latest bars and return zero or more signals.
    fn generate_signals(
        &self,
        data: &MarketData,
        account: &Account,
        positions: &[Position],
    ) -> Vec<Signal>;
}

/// Run `eval` for every configured symbol that has bars, passing the
/// position held in it (if any).
pub(crate) fn scan_symbols<F>(
    symbols: &[String],
    data: &MarketData,
    positions: &[Position],
    mut eval: F,
) -> Vec<Signal>
where
    F: FnMut(&str, &[Bar], Option<&Position>) -> Option<Signal>,
{
    symbols
        .iter()
        .filter_map(|symbol| {
            let bars = data.bars(symbol)?;
            let held = positions
                .iter()
                .find(|p| &p.symbol == symbol && p.quantity > 0.0);
            eval(symbol, bars, held)
        })
        .collect()
}
