use std::collections::HashMap;

use tracing::info;

use common::{Signal, SignalType};

use crate::config::ConflictPolicy;

/// Collapse competing signals from different strategies.
///
/// Within one (symbol, direction) only the most confident signal survives;
/// on equal confidence the earlier one wins. Opposite directions are then
/// handled by `policy`. Surviving signals keep their original order.
pub fn resolve_conflicts(signals: Vec<Signal>, policy: ConflictPolicy) -> Vec<Signal> {
    let mut best: HashMap<(&str, SignalType), usize> = HashMap::new();
    for (i, s) in signals.iter().enumerate() {
        best.entry((s.symbol.as_str(), s.signal_type))
            .and_modify(|kept| {
                if s.confidence > signals[*kept].confidence {
                    *kept = i;
                }
            })
            .or_insert(i);
    }

    let mut keep = vec![false; signals.len()];
    for &i in best.values() {
        keep[i] = true;
    }

    for (i, s) in signals.iter().enumerate() {
        if keep[i] {
            continue;
        }
        let winner = &signals[best[&(s.symbol.as_str(), s.signal_type)]];
        info!(
            symbol = %s.symbol,
            side = %s.signal_type,
            discarded = s.strategy().unwrap_or("-"),
            discarded_confidence = s.confidence,
            kept = winner.strategy().unwrap_or("-"),
            kept_confidence = winner.confidence,
            "Conflicting signal discarded"
        );
    }

    if policy == ConflictPolicy::HighestConfidence {
        for (&(symbol, _), &buy) in best.iter().filter(|((_, t), _)| *t == SignalType::Buy) {
            let Some(&sell) = best.get(&(symbol, SignalType::Sell)) else {
                continue;
            };
            let (winner, loser) = if signals[buy].confidence > signals[sell].confidence {
                (buy, sell)
            } else {
                (sell, buy)
            };
            keep[loser] = false;
            info!(
                symbol = %symbol,
                kept_side = %signals[winner].signal_type,
                kept = signals[winner].strategy().unwrap_or("-"),
                discarded_side = %signals[loser].signal_type,
                discarded = signals[loser].strategy().unwrap_or("-"),
                "Opposite-direction conflict resolved"
            );
        }
    }

    signals
        .into_iter()
        .zip(keep)
        .filter_map(|(s, k)| k.then_some(s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::STRATEGY_KEY;

    fn buy(symbol: &str, strategy: &str, confidence: f64) -> Signal {
        Signal::buy(symbol, 100.0, confidence, "t").with_metadata(STRATEGY_KEY, strategy)
    }

    fn sell(symbol: &str, strategy: &str, confidence: f64) -> Signal {
        Signal::sell(symbol, 100.0, confidence, "t").with_metadata(STRATEGY_KEY, strategy)
    }

    #[test]
    fn same_direction_keeps_highest_confidence() {
        let out = resolve_conflicts(
            vec![buy("AAPL", "A", 0.6), buy("AAPL", "B", 0.9), buy("MSFT", "A", 0.5)],
            ConflictPolicy::PassThrough,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].symbol, "AAPL");
        assert_eq!(out[0].strategy(), Some("B"));
        assert_eq!(out[1].symbol, "MSFT");
    }

    #[test]
    fn equal_confidence_keeps_first() {
        let out = resolve_conflicts(vec![buy("AAPL", "A", 0.7), buy("AAPL", "B", 0.7)], ConflictPolicy::PassThrough);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].strategy(), Some("A"));
    }

    #[test]
    fn pass_through_keeps_both_directions() {
        let out = resolve_conflicts(vec![buy("AAPL", "A", 0.9), sell("AAPL", "B", 0.4)], ConflictPolicy::PassThrough);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn highest_confidence_nets_directions_with_sell_on_ties() {
        let out = resolve_conflicts(
            vec![buy("AAPL", "A", 0.9), sell("AAPL", "B", 0.4)],
            ConflictPolicy::HighestConfidence,
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].is_buy());

        let tie = resolve_conflicts(
            vec![buy("AAPL", "A", 0.5), sell("AAPL", "B", 0.5), buy("TSLA", "A", 0.5)],
            ConflictPolicy::HighestConfidence,
        );
        assert_eq!(tie.len(), 2);
        assert!(tie[0].is_sell());
        assert_eq!(tie[1].symbol, "TSLA");
    }
}
