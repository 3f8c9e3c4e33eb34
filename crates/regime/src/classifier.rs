use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Bar, Error, Result};
use strategy::indicators::{atr, linear_regression_slope};

use crate::MarketRegime;

/// Thresholds for the rule-based classifier and the confirmation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Closes used for the trend regression.
    pub trend_period: usize,
    /// Short ATR window for the volatility ratio.
    pub vol_short: usize,
    /// Long ATR window for the volatility ratio.
    pub vol_long: usize,
    /// Minimum |trend angle| in degrees to call a market trending.
    pub trend_threshold_degrees: f64,
    pub high_vol_ratio: f64,
    pub low_vol_ratio: f64,
    pub crisis_vol_ratio: f64,
    pub crisis_vix: f64,
    /// Consecutive detections required before a new regime takes effect.
    pub confirmation_days: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_period: 50,
            vol_short: 20,
            vol_long: 100,
            trend_threshold_degrees: 5.0,
            high_vol_ratio: 1.5,
            low_vol_ratio: 0.8,
            crisis_vol_ratio: 2.0,
            crisis_vix: 30.0,
            confirmation_days: 3,
        }
    }
}

impl RegimeConfig {
    /// Bars needed for a full observation.
    pub fn min_bars(&self) -> usize {
        self.trend_period.max(self.vol_long + 1)
    }
}

/// One raw classification, before confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeObservation {
    pub regime: MarketRegime,
    pub trend_slope_degrees: f64,
    pub volatility_ratio: f64,
    pub vix: Option<f64>,
    /// Timestamp of the latest bar the observation was computed from.
    pub as_of: DateTime<Utc>,
}

/// Pluggable regime policy. The rule-based classifier is the default;
/// adaptive classifiers implement the same call.
pub trait RegimeClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn predict_regime(&self, bars: &[Bar], vix: Option<f64>) -> Result<RegimeObservation>;
}

/// Trend angle of the last `period` closes in degrees.
///
/// The regression slope is expressed as percent of the mean price per bar
/// before taking the arctangent, so the angle is independent of price scale.
pub fn calculate_trend_slope(closes: &[f64], period: usize) -> Option<f64> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    let slope = linear_regression_slope(window)?;
    Some((slope / mean * 100.0).atan().to_degrees())
}

/// Short-window ATR over long-window ATR. Above 1.5 reads as high
/// volatility, below 0.8 as low.
pub fn calculate_volatility_ratio(bars: &[Bar], short: usize, long: usize) -> Option<f64> {
    let long_atr = atr(bars, long)?;
    if long_atr <= 0.0 {
        return None;
    }
    Some(atr(bars, short)? / long_atr)
}

/// Priority-ordered rule cascade over slope, volatility ratio and VIX.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedClassifier {
    config: RegimeConfig,
}

impl RuleBasedClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    pub fn classify_regime(&self, slope_degrees: f64, vol_ratio: f64, vix: Option<f64>) -> MarketRegime {
        let c = &self.config;
        let vix_crisis = vix.is_some_and(|v| v > c.crisis_vix);

        if vol_ratio > c.crisis_vol_ratio || vix_crisis {
            MarketRegime::Crisis
        } else if vol_ratio > c.high_vol_ratio {
            MarketRegime::HighVolChoppy
        } else if vol_ratio < c.low_vol_ratio && slope_degrees.abs() < c.trend_threshold_degrees {
            MarketRegime::LowVolRange
        } else if slope_degrees.abs() >= c.trend_threshold_degrees {
            if slope_degrees > 0.0 {
                MarketRegime::BullTrending
            } else {
                MarketRegime::BearTrending
            }
        } else {
            MarketRegime::HighVolChoppy
        }
    }
}

impl RegimeClassifier for RuleBasedClassifier {
    fn name(&self) -> &str {
        "rule_based"
    }

    fn predict_regime(&self, bars: &[Bar], vix: Option<f64>) -> Result<RegimeObservation> {
        let needed = self.config.min_bars();
        let insufficient = || Error::InsufficientData { needed, got: bars.len() };
        if bars.len() < needed {
            return Err(insufficient());
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let slope = calculate_trend_slope(&closes, self.config.trend_period).ok_or_else(insufficient)?;
        let vol_ratio = calculate_volatility_ratio(bars, self.config.vol_short, self.config.vol_long)
            .ok_or_else(insufficient)?;
        let as_of = bars.last().map(|b| b.timestamp).ok_or_else(insufficient)?;

        Ok(RegimeObservation {
            regime: self.classify_regime(slope, vol_ratio, vix),
            trend_slope_degrees: slope,
            volatility_ratio: vol_ratio,
            vix,
            as_of,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bars(closes: &[f64], spread: impl Fn(usize) -> f64) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: c,
                high: c + spread(i),
                low: c - spread(i),
                close: c,
                volume: 1_000.0,
            })
            .collect()
    }

    fn classifier() -> RuleBasedClassifier {
        RuleBasedClassifier::new(RegimeConfig::default())
    }

    #[test]
    fn slope_is_scale_independent() {
        let small: Vec<f64> = (0..50).map(|i| 10.0 + 0.1 * i as f64).collect();
        let large: Vec<f64> = small.iter().map(|p| p * 1_000.0).collect();
        let a = calculate_trend_slope(&small, 50).unwrap();
        let b = calculate_trend_slope(&large, 50).unwrap();
        assert!((a - b).abs() < 1e-9);
        assert!(a > 0.0);
        assert!(calculate_trend_slope(&small, 60).is_none());
    }

    #[test]
    fn volatility_ratio_rises_when_recent_ranges_widen() {
        let closes = vec![100.0; 121];
        let calm_then_wild = bars(&closes, |i| if i >= 101 { 3.0 } else { 1.0 });
        let ratio = calculate_volatility_ratio(&calm_then_wild, 20, 100).unwrap();
        // short ATR = 6, long ATR = (80 * 2 + 20 * 6) / 100 = 2.8
        assert!((ratio - 6.0 / 2.8).abs() < 1e-9);
    }

    #[test]
    fn cascade_priorities() {
        let c = classifier();
        assert_eq!(c.classify_regime(20.0, 2.5, None), MarketRegime::Crisis);
        assert_eq!(c.classify_regime(20.0, 1.0, Some(35.0)), MarketRegime::Crisis);
        assert_eq!(c.classify_regime(20.0, 1.6, Some(20.0)), MarketRegime::HighVolChoppy);
        assert_eq!(c.classify_regime(1.0, 0.5, None), MarketRegime::LowVolRange);
        assert_eq!(c.classify_regime(10.0, 0.5, None), MarketRegime::BullTrending);
        assert_eq!(c.classify_regime(-10.0, 1.0, None), MarketRegime::BearTrending);
        assert_eq!(c.classify_regime(1.0, 1.0, None), MarketRegime::HighVolChoppy);
    }

    #[test]
    fn steady_uptrend_is_bull() {
        let closes: Vec<f64> = (0..150).map(|i| 100.0 + 0.5 * i as f64).collect();
        let obs = classifier().predict_regime(&bars(&closes, |_| 1.0), None).unwrap();
        assert_eq!(obs.regime, MarketRegime::BullTrending);
        assert!(obs.trend_slope_degrees > 5.0);
    }

    #[test]
    fn short_history_is_an_error() {
        let closes = vec![100.0; 60];
        let err = classifier().predict_regime(&bars(&closes, |_| 1.0), None).unwrap_err();
        assert!(matches!(err, Error::InsufficientData { needed: 101, got: 60 }));
    }
}
