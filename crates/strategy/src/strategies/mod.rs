mod bollinger;
mod breakout;
mod ma_crossover;
mod rsi_reversion;

pub use bollinger::BollingerBounce;
pub use breakout::BreakoutMomentum;
pub use ma_crossover::MaCrossover;
pub use rsi_reversion::RsiMeanReversion;
