use serde::{Deserialize, Serialize};

use common::CapitalAllocation;
use strategy::{BollingerBounce, BreakoutMomentum, MaCrossover, RsiMeanReversion};

/// Market state driving capital allocation and position scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    BullTrending,
    BearTrending,
    HighVolChoppy,
    LowVolRange,
    Crisis,
}

impl MarketRegime {
    pub const ALL: [MarketRegime; 5] = [
        MarketRegime::BullTrending,
        MarketRegime::BearTrending,
        MarketRegime::HighVolChoppy,
        MarketRegime::LowVolRange,
        MarketRegime::Crisis,
    ];

    /// Capital weights per strategy type for this regime. Every table sums to 1.0.
    ///
    /// Trend followers get the bulk of capital in directional markets,
    /// mean reversion in ranges and high volatility.
    pub fn allocation(&self) -> CapitalAllocation {
        let (ma, bb, rsi, bo) = match self {
            MarketRegime::BullTrending => (0.40, 0.10, 0.15, 0.35),
            MarketRegime::BearTrending => (0.30, 0.25, 0.25, 0.20),
            MarketRegime::HighVolChoppy => (0.15, 0.35, 0.35, 0.15),
            MarketRegime::LowVolRange => (0.10, 0.40, 0.40, 0.10),
            MarketRegime::Crisis => (0.20, 0.30, 0.40, 0.10),
        };
        CapitalAllocation::from_pairs([
            (MaCrossover::TYPE, ma),
            (BollingerBounce::TYPE, bb),
            (RsiMeanReversion::TYPE, rsi),
            (BreakoutMomentum::TYPE, bo),
        ])
    }

    /// Scalar applied to new position sizes: 1.0 normal, 0.25 in crisis.
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            MarketRegime::BullTrending => 1.0,
            MarketRegime::LowVolRange => 0.9,
            MarketRegime::BearTrending => 0.6,
            MarketRegime::HighVolChoppy => 0.5,
            MarketRegime::Crisis => 0.25,
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketRegime::BullTrending => write!(f, "BULL_TRENDING"),
            MarketRegime::BearTrending => write!(f, "BEAR_TRENDING"),
            MarketRegime::HighVolChoppy => write!(f, "HIGH_VOL_CHOPPY"),
            MarketRegime::LowVolRange => write!(f, "LOW_VOL_RANGE"),
            MarketRegime::Crisis => write!(f, "CRISIS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_allocation_table_sums_to_one() {
        for regime in MarketRegime::ALL {
            let alloc = regime.allocation();
            assert!(
                (alloc.total() - 1.0).abs() <= 0.01,
                "{regime} allocation sums to {}",
                alloc.total()
            );
            assert!(alloc.validate().is_ok());
        }
    }

    #[test]
    fn risk_multiplier_is_most_conservative_in_crisis() {
        for regime in MarketRegime::ALL {
            let m = regime.risk_multiplier();
            assert!((0.25..=1.0).contains(&m));
        }
        assert_eq!(MarketRegime::Crisis.risk_multiplier(), 0.25);
        assert_eq!(MarketRegime::BullTrending.risk_multiplier(), 1.0);
    }

    #[test]
    fn displays_in_screaming_case() {
        assert_eq!(MarketRegime::HighVolChoppy.to_string(), "HIGH_VOL_CHOPPY");
        assert_eq!(MarketRegime::Crisis.to_string(), "CRISIS");
    }
}
