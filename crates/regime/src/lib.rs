pub mod classifier;
pub mod detector;
pub mod types;

pub use classifier::{
    calculate_trend_slope, calculate_volatility_ratio, RegimeClassifier, RegimeConfig, RegimeObservation,
    RuleBasedClassifier,
};
pub use detector::{MarketRegimeDetector, RegimeUpdate};
pub use types::MarketRegime;
