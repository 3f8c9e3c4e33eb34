use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{Position, Result};

/// What the bot remembers about a position it opened. Brokers know the
/// quantity; only the bot knows which strategy owns it and where its
/// bracket sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionTag {
    pub strategy: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_order_id: Option<String>,
    #[serde(default)]
    pub take_profit_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl PositionTag {
    /// Ids of the resting stop and take-profit orders.
    pub fn bracket_ids(&self) -> impl Iterator<Item = &str> {
        [&self.stop_order_id, &self.take_profit_order_id]
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

/// An entry order that was still working when its cancel failed. It may
/// fill later; until it is terminal the symbol gets no new entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub order_id: String,
    pub strategy: String,
    /// Signal price, used when the broker reports no average fill price.
    pub price: f64,
    /// Quantity of this order already recorded in `positions`.
    #[serde(default)]
    pub recorded_qty: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub submitted_at: DateTime<Utc>,
}

/// Contents of `<name>_bot_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    /// Keyed by symbol.
    #[serde(default)]
    pub positions: BTreeMap<String, PositionTag>,
    /// Keyed by symbol.
    #[serde(default)]
    pub pending_entries: BTreeMap<String, PendingEntry>,
    pub last_cycle: Option<DateTime<Utc>>,
}

impl BotState {
    /// Record a fill. A second entry into a held symbol adds to the
    /// quantity and keeps the original owner.
    pub fn record_entry(&mut self, symbol: &str, tag: PositionTag) {
        match self.positions.get_mut(symbol) {
            Some(existing) => {
                let total = existing.quantity + tag.quantity;
                if total > 0.0 {
                    existing.entry_price =
                        (existing.entry_price * existing.quantity + tag.entry_price * tag.quantity) / total;
                }
                existing.quantity = total;
                if existing.strategy != tag.strategy {
                    warn!(
                        symbol,
                        owner = %existing.strategy,
                        other = %tag.strategy,
                        "Second strategy entered a held symbol; position stays with the owner"
                    );
                }
            }
            None => {
                self.positions.insert(symbol.to_string(), tag);
            }
        }
    }

    /// Reduce or drop the tag after an exit fill.
    pub fn record_exit(&mut self, symbol: &str, quantity: f64) -> Option<PositionTag> {
        let tag = self.positions.get_mut(symbol)?;
        tag.quantity -= quantity;
        if tag.quantity <= 1e-9 {
            return self.positions.remove(symbol);
        }
        None
    }

    /// Copy strategy ownership and stops onto broker positions, and forget
    /// tags whose position no longer exists at the broker. The forgotten
    /// tags are returned so their leftover bracket legs can be cancelled.
    pub fn enrich(&mut self, positions: &mut [Position]) -> Vec<(String, PositionTag)> {
        let held: Vec<&str> = positions
            .iter()
            .filter(|p| p.quantity != 0.0)
            .map(|p| p.symbol.as_str())
            .collect();
        let closed: Vec<String> = self
            .positions
            .keys()
            .filter(|s| !held.contains(&s.as_str()))
            .cloned()
            .collect();
        let mut dropped = Vec::new();
        for symbol in closed {
            if let Some(tag) = self.positions.remove(&symbol) {
                info!(symbol = %symbol, strategy = %tag.strategy, "Position closed outside the bot, tag dropped");
                dropped.push((symbol, tag));
            }
        }

        for position in positions.iter_mut() {
            if let Some(tag) = self.positions.get(&position.symbol) {
                position
                    .metadata
                    .insert(common::STRATEGY_KEY.to_string(), tag.strategy.clone().into());
                if position.stop_loss.is_none() {
                    position.stop_loss = tag.stop_loss;
                }
            }
        }
        dropped
    }
}

/// JSON file holding `BotState`. Writes go to a temp file that is then
/// renamed over the target, so a crash never leaves a half-written file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file → empty state.
    pub fn load(&self) -> Result<BotState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No bot state file, starting fresh");
            return Ok(BotState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        let state: BotState = serde_json::from_str(&raw)?;
        info!(path = %self.path.display(), positions = state.positions.len(), "Bot state loaded");
        Ok(state)
    }

    pub fn save(&self, state: &BotState) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tag(strategy: &str, qty: f64, entry: f64) -> PositionTag {
        PositionTag {
            strategy: strategy.into(),
            quantity: qty,
            entry_price: entry,
            stop_loss: Some(entry * 0.95),
            take_profit: Some(entry * 1.1),
            stop_order_id: None,
            take_profit_order_id: None,
            opened_at: Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap(),
        }
    }

    fn pending(order_id: &str) -> PendingEntry {
        PendingEntry {
            order_id: order_id.into(),
            strategy: "trend".into(),
            price: 100.0,
            recorded_qty: 0.0,
            stop_loss: Some(95.0),
            take_profit: None,
            submitted_at: Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap(),
        }
    }

    #[test]
    fn save_then_load_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("bot_state.json"));
        let mut state = BotState::default();
        state.record_entry("AAPL", tag("trend", 10.0, 100.0));
        state.pending_entries.insert("MSFT".into(), pending("o-1"));
        state.last_cycle = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());

        store.save(&state).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn missing_file_is_empty_and_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("bot_state.json"));
        assert_eq!(store.load().unwrap(), BotState::default());

        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn entries_accumulate_and_exits_drop_tags() {
        let mut state = BotState::default();
        state.record_entry("AAPL", tag("trend", 10.0, 100.0));
        state.record_entry("AAPL", tag("dip", 10.0, 110.0));
        let t = &state.positions["AAPL"];
        assert_eq!(t.strategy, "trend");
        assert_eq!(t.quantity, 20.0);
        assert!((t.entry_price - 105.0).abs() < 1e-9);

        assert!(state.record_exit("AAPL", 5.0).is_none());
        assert_eq!(state.positions["AAPL"].quantity, 15.0);
        assert!(state.record_exit("AAPL", 15.0).is_some());
        assert!(state.positions.is_empty());
    }

    #[test]
    fn older_state_files_without_pending_entries_load() {
        let raw = r#"{ "positions": {}, "last_cycle": null }"#;
        let state: BotState = serde_json::from_str(raw).unwrap();
        assert!(state.pending_entries.is_empty());
    }

    #[test]
    fn enrich_tags_positions_and_returns_closed_ones() {
        let mut state = BotState::default();
        state.record_entry("AAPL", tag("trend", 10.0, 100.0));
        let mut msft = tag("dip", 5.0, 300.0);
        msft.stop_order_id = Some("stop-1".into());
        msft.take_profit_order_id = Some("tp-1".into());
        state.record_entry("MSFT", msft);

        let mut positions = vec![Position::long("AAPL", 10.0, 100.0, 104.0), Position::long("TSLA", 1.0, 200.0, 200.0)];
        let dropped = state.enrich(&mut positions);

        assert_eq!(positions[0].strategy(), Some("trend"));
        assert_eq!(positions[0].stop_loss, Some(95.0));
        assert_eq!(positions[1].strategy(), None);
        assert!(!state.positions.contains_key("MSFT"));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, "MSFT");
        assert_eq!(dropped[0].1.bracket_ids().collect::<Vec<_>>(), vec!["stop-1", "tp-1"]);
    }
}
