use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use common::{Bar, CapitalAllocation, Result};

use crate::classifier::{RegimeClassifier, RegimeConfig, RegimeObservation, RuleBasedClassifier};
use crate::MarketRegime;

/// Outcome of one detection pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeUpdate {
    /// Confirmed regime after this pass.
    pub current: MarketRegime,
    /// Raw classification of the latest bars.
    pub observed: MarketRegime,
    /// True when `current` switched during this pass.
    pub changed: bool,
    pub previous: Option<MarketRegime>,
    /// Candidate regime still waiting for confirmation.
    pub pending: Option<MarketRegime>,
    pub pending_days: u32,
    pub observation: RegimeObservation,
    /// False when the latest bar was already seen and state was left untouched.
    pub fresh: bool,
}

/// Tracks the confirmed market regime with hysteresis.
///
/// A new classification only becomes current after it has been observed on
/// `confirmation_days` consecutive fresh bars. Any other observation resets
/// the candidate. Calling twice on the same latest bar is a no-op.
pub struct MarketRegimeDetector {
    classifier: Box<dyn RegimeClassifier>,
    confirmation_days: u32,
    current: Option<MarketRegime>,
    pending: Option<MarketRegime>,
    pending_days: u32,
    last_observed: Option<DateTime<Utc>>,
    last_observation: Option<RegimeObservation>,
}

impl MarketRegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        let confirmation_days = config.confirmation_days;
        Self::with_classifier(Box::new(RuleBasedClassifier::new(config)), confirmation_days)
    }

    pub fn with_classifier(classifier: Box<dyn RegimeClassifier>, confirmation_days: u32) -> Self {
        Self {
            classifier,
            confirmation_days: confirmation_days.max(1),
            current: None,
            pending: None,
            pending_days: 0,
            last_observed: None,
            last_observation: None,
        }
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Confirmed regime, `None` until the first successful detection.
    pub fn current_regime(&self) -> Option<MarketRegime> {
        self.current
    }

    pub fn pending(&self) -> Option<(MarketRegime, u32)> {
        self.pending.map(|r| (r, self.pending_days))
    }

    /// Allocation table of the confirmed regime.
    pub fn allocation(&self) -> Option<CapitalAllocation> {
        self.current.map(|r| r.allocation())
    }

    /// Risk multiplier of the confirmed regime, 1.0 before the first detection.
    pub fn risk_multiplier(&self) -> f64 {
        self.current.map_or(1.0, |r| r.risk_multiplier())
    }

    pub fn detect_regime(&mut self, bars: &[Bar], vix: Option<f64>) -> Result<RegimeUpdate> {
        let observation = self.classifier.predict_regime(bars, vix)?;
        let observed = observation.regime;

        if let (Some(current), Some(last), Some(seen)) =
            (self.current, self.last_observed, self.last_observation.as_ref())
        {
            if last >= observation.as_of {
                debug!(as_of = %observation.as_of, "Regime already evaluated for this bar");
                return Ok(self.snapshot(current, seen.regime, false, None, seen.clone(), false));
            }
        }
        self.last_observed = Some(observation.as_of);
        self.last_observation = Some(observation.clone());

        let Some(current) = self.current else {
            info!(
                regime = %observed,
                slope = observation.trend_slope_degrees,
                vol_ratio = observation.volatility_ratio,
                "Initial market regime"
            );
            self.current = Some(observed);
            return Ok(self.snapshot(observed, observed, true, None, observation, true));
        };

        if observed == current {
            if let Some(candidate) = self.pending.take() {
                debug!(candidate = %candidate, "Regime candidate dropped");
            }
            self.pending_days = 0;
            return Ok(self.snapshot(current, observed, false, None, observation, true));
        }

        if self.pending == Some(observed) {
            self.pending_days += 1;
        } else {
            self.pending = Some(observed);
            self.pending_days = 1;
        }

        if self.pending_days >= self.confirmation_days {
            info!(
                from = %current,
                to = %observed,
                days = self.pending_days,
                slope = observation.trend_slope_degrees,
                vol_ratio = observation.volatility_ratio,
                "Market regime change confirmed"
            );
            self.current = Some(observed);
            self.pending = None;
            self.pending_days = 0;
            return Ok(self.snapshot(observed, observed, true, Some(current), observation, true));
        }

        debug!(
            current = %current,
            candidate = %observed,
            days = self.pending_days,
            needed = self.confirmation_days,
            "Regime change pending confirmation"
        );
        Ok(self.snapshot(current, observed, false, None, observation, true))
    }

    fn snapshot(
        &self,
        current: MarketRegime,
        observed: MarketRegime,
        changed: bool,
        previous: Option<MarketRegime>,
        observation: RegimeObservation,
        fresh: bool,
    ) -> RegimeUpdate {
        RegimeUpdate {
            current,
            observed,
            changed,
            previous,
            pending: self.pending,
            pending_days: self.pending_days,
            observation,
            fresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    /// Replays a scripted sequence of regimes, one per call.
    struct Scripted {
        script: Mutex<Vec<MarketRegime>>,
    }

    impl Scripted {
        fn new(mut regimes: Vec<MarketRegime>) -> Self {
            regimes.reverse();
            Self { script: Mutex::new(regimes) }
        }
    }

    impl RegimeClassifier for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn predict_regime(&self, bars: &[Bar], vix: Option<f64>) -> Result<RegimeObservation> {
            let regime = self.script.lock().unwrap().pop().expect("script exhausted");
            Ok(RegimeObservation {
                regime,
                trend_slope_degrees: 0.0,
                volatility_ratio: 1.0,
                vix,
                as_of: bars.last().unwrap().timestamp,
            })
        }
    }

    fn bar(day: i64) -> Vec<Bar> {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(day);
        vec![Bar {
            timestamp: ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 1_000.0,
        }]
    }

    fn detector(script: Vec<MarketRegime>) -> MarketRegimeDetector {
        MarketRegimeDetector::with_classifier(Box::new(Scripted::new(script)), 3)
    }

    use MarketRegime::*;

    #[test]
    fn first_detection_sets_current() {
        let mut d = detector(vec![BearTrending]);
        assert_eq!(d.current_regime(), None);
        assert_eq!(d.risk_multiplier(), 1.0);
        let update = d.detect_regime(&bar(0), None).unwrap();
        assert!(update.changed);
        assert_eq!(d.current_regime(), Some(BearTrending));
    }

    #[test]
    fn change_needs_three_consecutive_observations() {
        let mut d = detector(vec![BullTrending, Crisis, Crisis, Crisis]);
        d.detect_regime(&bar(0), None).unwrap();

        let u1 = d.detect_regime(&bar(1), None).unwrap();
        assert_eq!(u1.current, BullTrending);
        assert_eq!(u1.pending, Some(Crisis));
        assert_eq!(u1.pending_days, 1);

        let u2 = d.detect_regime(&bar(2), None).unwrap();
        assert_eq!(u2.current, BullTrending);
        assert_eq!(u2.pending_days, 2);

        let u3 = d.detect_regime(&bar(3), None).unwrap();
        assert!(u3.changed);
        assert_eq!(u3.previous, Some(BullTrending));
        assert_eq!(d.current_regime(), Some(Crisis));
        assert_eq!(d.pending(), None);
        assert_eq!(d.risk_multiplier(), 0.25);
    }

    #[test]
    fn interruption_resets_the_candidate() {
        let mut d = detector(vec![BullTrending, Crisis, Crisis, BullTrending, Crisis, Crisis]);
        d.detect_regime(&bar(0), None).unwrap();
        d.detect_regime(&bar(1), None).unwrap();
        d.detect_regime(&bar(2), None).unwrap();
        let reset = d.detect_regime(&bar(3), None).unwrap();
        assert_eq!(reset.pending, None);
        d.detect_regime(&bar(4), None).unwrap();
        let u = d.detect_regime(&bar(5), None).unwrap();
        assert_eq!(u.current, BullTrending);
        assert_eq!(u.pending_days, 2);
    }

    #[test]
    fn switching_candidates_restarts_the_count() {
        let mut d = detector(vec![BullTrending, Crisis, Crisis, LowVolRange]);
        for day in 0..4 {
            d.detect_regime(&bar(day), None).unwrap();
        }
        assert_eq!(d.pending(), Some((LowVolRange, 1)));
        assert_eq!(d.current_regime(), Some(BullTrending));
    }

    #[test]
    fn same_bar_twice_does_not_advance_confirmation() {
        // The repeated call still consumes a scripted value but must not count it.
        let mut d = detector(vec![BullTrending, Crisis, Crisis, Crisis, Crisis]);
        d.detect_regime(&bar(0), None).unwrap();
        d.detect_regime(&bar(1), None).unwrap();
        let repeat = d.detect_regime(&bar(1), None).unwrap();
        assert!(!repeat.fresh);
        assert_eq!(repeat.pending_days, 1);
        d.detect_regime(&bar(2), None).unwrap();
        assert_eq!(d.current_regime(), Some(BullTrending));
        d.detect_regime(&bar(3), None).unwrap();
        assert_eq!(d.current_regime(), Some(Crisis));
    }
}
