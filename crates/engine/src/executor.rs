use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::{
    Account, Bar, Broker, Error, MarketData, Order, OrderAck, OrderSide, OrderStatus, Position, RejectionReason,
    Result, Signal, SignalType,
};
use orchestrator::StrategyOrchestrator;
use regime::MarketRegime;

use crate::config::BotConfig;
use crate::state::{BotState, PendingEntry, PositionTag, StateStore};

/// Owner recorded for entries whose signal names no strategy.
const UNASSIGNED: &str = "unassigned";

/// Outcome of one executed signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub signal_type: SignalType,
    pub symbol: String,
    pub strategy: Option<String>,
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub fill_price: Option<f64>,
    pub stop_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    /// Non-fatal problems: unobserved fills, failed bracket legs.
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        self.filled_qty > 0.0
    }
}

/// What one pass of `run_strategy_cycle` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub equity: f64,
    pub open_positions: usize,
    pub symbols_loaded: usize,
    pub symbols_skipped: Vec<String>,
    pub signals: usize,
    pub executed: Vec<ExecutionReport>,
    pub failed: usize,
    pub regime: Option<MarketRegime>,
}

/// Drives one bot: pulls broker state, runs the orchestrator, and turns
/// accepted signals into orders.
///
/// This is the ONLY component that calls `Broker::submit_order`.
pub struct TradingBot {
    name: String,
    broker: Arc<dyn Broker>,
    orchestrator: StrategyOrchestrator,
    symbols: Vec<String>,
    lookback_bars: usize,
    fill_timeout: Duration,
    fill_poll_interval: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) error_backoff: Duration,
    state: BotState,
    store: StateStore,
}

impl TradingBot {
    /// Loads persisted position tags from the configured state file.
    pub fn new(config: &BotConfig, broker: Arc<dyn Broker>, orchestrator: StrategyOrchestrator) -> Result<Self> {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = config
            .strategy
            .symbols
            .iter()
            .cloned()
            .chain(orchestrator.symbols())
            .filter(|s| seen.insert(s.clone()))
            .collect();

        let store = StateStore::new(config.bot.state_path());
        let state = store.load()?;

        info!(
            bot = %config.bot.name,
            broker = %broker.name(),
            symbols = ?symbols,
            tracked_positions = state.positions.len(),
            "TradingBot ready"
        );

        Ok(Self {
            name: config.bot.name.clone(),
            broker,
            orchestrator,
            symbols,
            lookback_bars: config.strategy.lookback_bars,
            fill_timeout: config.bot.fill_timeout(),
            fill_poll_interval: config.bot.fill_poll_interval(),
            poll_interval: config.bot.poll_interval(),
            error_backoff: config.bot.error_backoff(),
            state,
            store,
        })
    }

    /// Override fill polling, mainly for tests against slow fakes.
    pub fn with_fill_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.fill_timeout = timeout;
        self.fill_poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    pub fn orchestrator(&self) -> &StrategyOrchestrator {
        &self.orchestrator
    }

    // ─── Broker views ─────────────────────────────────────────────────────────

    pub async fn get_account(&self) -> Result<Account> {
        self.broker.get_account().await
    }

    /// Broker positions tagged with owning strategy and stop from bot state.
    ///
    /// Tags whose position is gone (a stop or target filled, or a manual
    /// close) are dropped and their remaining bracket leg is cancelled.
    pub async fn get_positions(&mut self) -> Result<Vec<Position>> {
        let mut positions = self.broker.get_positions().await?;
        let dropped = self.state.enrich(&mut positions);
        for (symbol, tag) in dropped {
            let mut warnings = Vec::new();
            self.cancel_bracket(&symbol, &tag, &mut warnings).await;
        }
        Ok(positions)
    }

    pub async fn get_market_data(&self, symbol: &str) -> Result<Vec<Bar>> {
        self.broker.get_market_data(symbol, self.lookback_bars).await
    }

    // ─── Execution ────────────────────────────────────────────────────────────

    /// Turn one signal into broker orders. HOLD does nothing.
    pub async fn execute_signal(&mut self, signal: &Signal) -> Result<Option<ExecutionReport>> {
        match signal.signal_type {
            SignalType::Hold => Ok(None),
            SignalType::Buy if self.state.pending_entries.contains_key(&signal.symbol) => {
                warn!(symbol = %signal.symbol, "Earlier entry order still working, BUY skipped");
                Ok(None)
            }
            SignalType::Buy => self.enter(signal).await.map(Some),
            SignalType::Sell => self.exit(signal).await,
        }
    }

    async fn enter(&mut self, signal: &Signal) -> Result<ExecutionReport> {
        let quantity = signal.position_size.filter(|q| *q > 0.0).ok_or_else(|| Error::OrderRejected {
            reason: RejectionReason::InvalidSignal(format!("BUY {} has no position size", signal.symbol)),
        })?;
        let strategy = signal.strategy().unwrap_or(UNASSIGNED).to_string();
        info!(
            symbol = %signal.symbol,
            strategy = %strategy,
            qty = quantity,
            price = signal.price,
            reason = %signal.reason,
            "Executing BUY"
        );

        let order = Order::market(&signal.symbol, OrderSide::Buy, quantity);
        let ack = self.broker.submit_order(&order).await?;
        let mut report = ExecutionReport {
            signal_type: SignalType::Buy,
            symbol: signal.symbol.clone(),
            strategy: signal.strategy().map(String::from),
            order_id: ack.id.clone(),
            status: ack.status,
            filled_qty: 0.0,
            fill_price: None,
            stop_order_id: None,
            take_profit_order_id: None,
            warnings: Vec::new(),
        };
        if ack.status == OrderStatus::Rejected {
            warn!(symbol = %signal.symbol, order_id = %ack.id, "Entry order rejected by broker");
            report.warnings.push("entry order rejected by broker".into());
            return Ok(report);
        }
        self.orchestrator.record_execution(signal);

        let (ack, still_working) = self.settle(ack).await;
        report.status = ack.status;
        if still_working {
            // Track it so the symbol is not bought again while it can still fill.
            self.state.pending_entries.insert(
                signal.symbol.clone(),
                PendingEntry {
                    order_id: ack.id.clone(),
                    strategy: strategy.clone(),
                    price: signal.price,
                    recorded_qty: ack.filled_qty.max(0.0),
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    submitted_at: Utc::now(),
                },
            );
            report
                .warnings
                .push("entry order could not be cancelled; tracked as pending".into());
        }
        if ack.filled_qty <= 0.0 {
            if !still_working {
                warn!(symbol = %signal.symbol, order_id = %ack.id, status = ?ack.status, "Fill not observed; entry cancelled");
                report
                    .warnings
                    .push(format!("fill not observed (status {:?}); entry cancelled", ack.status));
            }
            return Ok(report);
        }

        let filled = ack.filled_qty;
        let fill_price = ack.filled_avg_price.unwrap_or(signal.price);
        report.filled_qty = filled;
        report.fill_price = Some(fill_price);
        info!(symbol = %signal.symbol, qty = filled, price = fill_price, "Entry filled");

        let entry = PositionTag {
            strategy,
            quantity: filled,
            entry_price: fill_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            stop_order_id: None,
            take_profit_order_id: None,
            opened_at: Utc::now(),
        };
        let (stop_id, target_id) = self.open_position(&signal.symbol, entry, &mut report.warnings).await;
        report.stop_order_id = stop_id;
        report.take_profit_order_id = target_id;
        Ok(report)
    }

    /// Record a filled entry and protect the whole holding with one bracket.
    /// Adding to a held symbol replaces its bracket with one sized for the
    /// combined quantity at the owner's levels.
    async fn open_position(
        &mut self,
        symbol: &str,
        entry: PositionTag,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let (quantity, stop, target) = match self.state.positions.get(symbol).cloned() {
            Some(existing) => {
                self.cancel_bracket(symbol, &existing, warnings).await;
                (
                    existing.quantity + entry.quantity,
                    existing.stop_loss.or(entry.stop_loss),
                    existing.take_profit.or(entry.take_profit),
                )
            }
            None => (entry.quantity, entry.stop_loss, entry.take_profit),
        };
        let (stop_id, target_id) = self.place_bracket(symbol, quantity, stop, target, warnings).await;

        self.state.record_entry(symbol, entry);
        if let Some(tag) = self.state.positions.get_mut(symbol) {
            tag.stop_order_id = stop_id.clone();
            tag.take_profit_order_id = target_id.clone();
        }
        (stop_id, target_id)
    }

    /// Stop then target, one after the other. A failed leg leaves the
    /// position partly protected and is reported in `warnings`.
    async fn place_bracket(
        &self,
        symbol: &str,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let mut stop_id = None;
        let mut target_id = None;
        if let Some(stop) = stop_loss {
            let order = Order::stop(symbol, OrderSide::Sell, quantity, stop);
            stop_id = self.place_bracket_leg(&order, "stop-loss", warnings).await;
        }
        if let Some(target) = take_profit {
            let order = Order::limit(symbol, OrderSide::Sell, quantity, target);
            target_id = self.place_bracket_leg(&order, "take-profit", warnings).await;
        }
        (stop_id, target_id)
    }

    async fn place_bracket_leg(&self, order: &Order, leg: &str, warnings: &mut Vec<String>) -> Option<String> {
        match self.broker.submit_order(order).await {
            Ok(ack) if ack.status != OrderStatus::Rejected => {
                debug!(symbol = %order.symbol, leg, order_id = %ack.id, "Bracket leg placed");
                Some(ack.id)
            }
            Ok(ack) => {
                warn!(symbol = %order.symbol, leg, order_id = %ack.id, "Bracket leg rejected");
                warnings.push(format!("{leg} order rejected"));
                None
            }
            Err(e) => {
                error!(symbol = %order.symbol, leg, error = %e, "Bracket leg failed");
                warnings.push(format!("{leg} order failed: {e}"));
                None
            }
        }
    }

    async fn cancel_bracket(&self, symbol: &str, tag: &PositionTag, warnings: &mut Vec<String>) {
        for id in tag.bracket_ids() {
            match self.broker.cancel_order(id).await {
                Ok(()) => debug!(symbol, order_id = %id, "Bracket leg cancelled"),
                Err(e) => {
                    warn!(symbol, order_id = %id, error = %e, "Bracket cancel failed");
                    warnings.push(format!("cancel of {id} failed: {e}"));
                }
            }
        }
    }

    /// Put a fresh bracket on whatever the tag for `symbol` still holds.
    async fn restore_bracket(&mut self, symbol: &str, warnings: &mut Vec<String>) {
        let Some(tag) = self.state.positions.get(symbol).cloned() else {
            return;
        };
        if tag.quantity <= 0.0 {
            return;
        }
        let (stop_id, target_id) = self
            .place_bracket(symbol, tag.quantity, tag.stop_loss, tag.take_profit, warnings)
            .await;
        info!(symbol, qty = tag.quantity, stop = ?stop_id, target = ?target_id, "Bracket restored");
        if let Some(t) = self.state.positions.get_mut(symbol) {
            t.stop_order_id = stop_id;
            t.take_profit_order_id = target_id;
        }
    }

    async fn exit(&mut self, signal: &Signal) -> Result<Option<ExecutionReport>> {
        let tag = self.state.positions.get(&signal.symbol).cloned();
        let quantity = match signal.position_size.filter(|q| *q > 0.0) {
            Some(q) => q,
            None => match &tag {
                Some(t) => t.quantity,
                None => self
                    .broker
                    .get_positions()
                    .await?
                    .into_iter()
                    .find(|p| p.symbol == signal.symbol)
                    .map_or(0.0, |p| p.quantity),
            },
        };
        if quantity <= 0.0 {
            warn!(symbol = %signal.symbol, "SELL with nothing held, ignored");
            return Ok(None);
        }

        let strategy = signal.strategy().map(String::from);
        info!(
            symbol = %signal.symbol,
            strategy = ?strategy,
            qty = quantity,
            reason = %signal.reason,
            "Executing SELL"
        );

        // Brokers reserve shares for resting sells, so the bracket comes off
        // first and goes back on for anything the exit leaves open.
        let mut warnings = Vec::new();
        if let Some(tag) = &tag {
            self.cancel_bracket(&signal.symbol, tag, &mut warnings).await;
            if let Some(t) = self.state.positions.get_mut(&signal.symbol) {
                t.stop_order_id = None;
                t.take_profit_order_id = None;
            }
        }

        let order = Order::market(&signal.symbol, OrderSide::Sell, quantity);
        let ack = match self.broker.submit_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol = %signal.symbol, error = %e, "Exit order failed");
                self.restore_bracket(&signal.symbol, &mut warnings).await;
                return Err(e);
            }
        };
        let (ack, still_working) = if ack.status == OrderStatus::Rejected {
            warn!(symbol = %signal.symbol, order_id = %ack.id, "Exit order rejected by broker");
            warnings.push("exit order rejected by broker".into());
            (ack, false)
        } else {
            self.orchestrator.record_execution(signal);
            self.settle(ack).await
        };

        let fill_price = (ack.filled_qty > 0.0).then(|| ack.filled_avg_price.unwrap_or(signal.price));
        if ack.filled_qty > 0.0 {
            info!(symbol = %signal.symbol, qty = ack.filled_qty, price = ?fill_price, "Exit filled");
            if self.state.record_exit(&signal.symbol, ack.filled_qty).is_some() {
                debug!(symbol = %signal.symbol, "Position tag closed");
            }
        } else if ack.status != OrderStatus::Rejected {
            warnings.push(format!("exit fill not observed (status {:?})", ack.status));
        }

        if still_working {
            // Re-placing the bracket now could sell the same shares twice.
            error!(symbol = %signal.symbol, order_id = %ack.id, "Exit order could not be cancelled; position left without a bracket");
            warnings.push("exit order still working; bracket not restored".into());
        } else {
            self.restore_bracket(&signal.symbol, &mut warnings).await;
        }
        let (stop_order_id, take_profit_order_id) = self
            .state
            .positions
            .get(&signal.symbol)
            .map_or((None, None), |t| (t.stop_order_id.clone(), t.take_profit_order_id.clone()));

        Ok(Some(ExecutionReport {
            signal_type: SignalType::Sell,
            symbol: signal.symbol.clone(),
            strategy,
            order_id: ack.id,
            status: ack.status,
            filled_qty: ack.filled_qty,
            fill_price,
            stop_order_id,
            take_profit_order_id,
            warnings,
        }))
    }

    /// Poll until the order is terminal or the timeout passes. Returns the
    /// last state seen; poll errors are logged, not raised.
    async fn wait_for_fill(&self, mut ack: OrderAck) -> OrderAck {
        let deadline = Instant::now() + self.fill_timeout;
        while !ack.status.is_terminal() && Instant::now() < deadline {
            tokio::time::sleep(self.fill_poll_interval).await;
            match self.broker.get_order(&ack.id).await {
                Ok(latest) => ack = latest,
                Err(e) => warn!(order_id = %ack.id, error = %e, "Order status poll failed"),
            }
        }
        ack
    }

    /// Wait for a fill, then cancel whatever part of the order is still
    /// working. The flag is true when the cancel failed and the order may
    /// still fill later.
    async fn settle(&self, ack: OrderAck) -> (OrderAck, bool) {
        let ack = self.wait_for_fill(ack).await;
        if ack.status.is_terminal() {
            return (ack, false);
        }
        if let Err(e) = self.broker.cancel_order(&ack.id).await {
            error!(symbol = %ack.symbol, order_id = %ack.id, error = %e, "Cancel of unfilled order failed");
            return (ack, true);
        }
        info!(symbol = %ack.symbol, order_id = %ack.id, filled = ack.filled_qty, "Unfilled order cancelled");
        match self.broker.get_order(&ack.id).await {
            // A fill can land between the last poll and the cancel.
            Ok(latest) if latest.status.is_terminal() => (latest, false),
            Ok(latest) => (
                OrderAck {
                    status: OrderStatus::Canceled,
                    ..latest
                },
                false,
            ),
            Err(e) => {
                warn!(order_id = %ack.id, error = %e, "Order status after cancel unknown");
                (
                    OrderAck {
                        status: OrderStatus::Canceled,
                        ..ack
                    },
                    false,
                )
            }
        }
    }

    /// Follow up on entries whose cancel failed in an earlier cycle: retry
    /// the cancel while they work, and bracket any late fill once they end.
    pub async fn reconcile_pending_entries(&mut self) {
        let pending: Vec<(String, PendingEntry)> = self
            .state
            .pending_entries
            .iter()
            .map(|(s, p)| (s.clone(), p.clone()))
            .collect();

        for (symbol, entry) in pending {
            let latest = match self.broker.get_order(&entry.order_id).await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(symbol = %symbol, order_id = %entry.order_id, error = %e, "Pending entry status unknown");
                    continue;
                }
            };
            if !latest.status.is_terminal() {
                if let Err(e) = self.broker.cancel_order(&entry.order_id).await {
                    warn!(symbol = %symbol, order_id = %entry.order_id, error = %e, "Pending entry still working");
                }
                continue;
            }

            self.state.pending_entries.remove(&symbol);
            let late = latest.filled_qty - entry.recorded_qty;
            if late <= 1e-9 {
                info!(symbol = %symbol, order_id = %entry.order_id, status = ?latest.status, "Pending entry ended without a further fill");
                continue;
            }
            let fill_price = latest.filled_avg_price.unwrap_or(entry.price);
            let tag = PositionTag {
                strategy: entry.strategy,
                quantity: late,
                entry_price: fill_price,
                stop_loss: entry.stop_loss,
                take_profit: entry.take_profit,
                stop_order_id: None,
                take_profit_order_id: None,
                opened_at: Utc::now(),
            };
            let mut warnings = Vec::new();
            let (stop_id, target_id) = self.open_position(&symbol, tag, &mut warnings).await;
            info!(
                symbol = %symbol,
                qty = late,
                price = fill_price,
                stop = ?stop_id,
                target = ?target_id,
                warnings = warnings.len(),
                "Late entry fill reconciled"
            );
        }
    }

    // ─── Cycle ────────────────────────────────────────────────────────────────

    /// One full pass: snapshot, data, signals, execution, state save.
    pub async fn run_strategy_cycle(&mut self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        self.reconcile_pending_entries().await;
        let account = self.get_account().await?;
        let positions = self.get_positions().await?;
        let account = Account {
            positions_count: positions.len(),
            ..account
        };

        let mut data = MarketData::new();
        let mut skipped = Vec::new();
        for symbol in &self.symbols {
            match self.get_market_data(symbol).await {
                Ok(bars) if !bars.is_empty() => data.insert(symbol.clone(), bars),
                Ok(_) => {
                    warn!(symbol = %symbol, "No bars returned, symbol skipped this cycle");
                    skipped.push(symbol.clone());
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Market data fetch failed, symbol skipped this cycle");
                    skipped.push(symbol.clone());
                }
            }
        }
        if data.is_empty() {
            return Err(Error::Broker("no market data for any symbol".into()));
        }

        let signals = self
            .orchestrator
            .generate_signals(&data, &account, &positions, started_at);

        let mut executed = Vec::new();
        let mut failed = 0;
        for signal in &signals {
            match self.execute_signal(signal).await {
                Ok(Some(report)) => executed.push(report),
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    error!(symbol = %signal.symbol, signal = %signal.signal_type, error = %e, "Signal execution failed");
                }
            }
        }

        self.state.last_cycle = Some(started_at);
        if let Err(e) = self.store.save(&self.state) {
            error!(path = %self.store.path().display(), error = %e, "Failed to persist bot state");
        }

        let summary = CycleSummary {
            started_at,
            equity: account.equity,
            open_positions: positions.len(),
            symbols_loaded: self.symbols.len() - skipped.len(),
            symbols_skipped: skipped,
            signals: signals.len(),
            executed,
            failed,
            regime: self.orchestrator.current_regime(),
        };
        info!(
            bot = %self.name,
            equity = summary.equity,
            positions = summary.open_positions,
            signals = summary.signals,
            executed = summary.executed.len(),
            failed = summary.failed,
            skipped = summary.symbols_skipped.len(),
            "Strategy cycle complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::{OrderType, STRATEGY_KEY};
    use orchestrator::OrchestratorConfig;
    use paper::PaperBroker;
    use regime::RegimeConfig;
    use risk::RiskConfig;
    use strategy::Strategy;

    // ─── Fixtures ─────────────────────────────────────────────────────────────

    fn bars(close: f64, n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Bar {
                timestamp: start + ChronoDuration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    /// Buys 5 AAPL whenever it holds nothing of its own.
    struct BuyWhenFlat {
        symbols: Vec<String>,
    }

    impl Strategy for BuyWhenFlat {
        fn name(&self) -> &str {
            "trend"
        }

        fn kind(&self) -> &str {
            "ma_crossover"
        }

        fn symbols(&self) -> &[String] {
            &self.symbols
        }

        fn generate_signals(&self, data: &MarketData, _account: &Account, positions: &[Position]) -> Vec<Signal> {
            let Some(price) = data.latest_price("AAPL") else {
                return Vec::new();
            };
            if positions.iter().any(|p| p.symbol == "AAPL") {
                return Vec::new();
            }
            vec![Signal::buy("AAPL", price, 0.8, "flat")
                .with_position_size(5.0)
                .with_stop_loss(price * 0.95)
                .with_take_profit(price * 1.1)]
        }
    }

    fn config(dir: &tempfile::TempDir, symbols: &[&str]) -> BotConfig {
        let mut cfg = BotConfig::default();
        cfg.strategy.symbols = symbols.iter().map(|s| s.to_string()).collect();
        cfg.bot.state_path = Some(dir.path().join("bot_state.json"));
        cfg
    }

    fn new_bot(cfg: &BotConfig, broker: Arc<dyn Broker>) -> TradingBot {
        let orchestrator = StrategyOrchestrator::new(
            vec![Box::new(BuyWhenFlat {
                symbols: vec!["AAPL".into()],
            })],
            OrchestratorConfig::default(),
            RiskConfig::default(),
            RegimeConfig::default(),
        )
        .unwrap();
        TradingBot::new(cfg, broker, orchestrator)
            .unwrap()
            .with_fill_timing(Duration::from_millis(20), Duration::from_millis(1))
    }

    async fn paper() -> Arc<PaperBroker> {
        let broker = Arc::new(PaperBroker::new(100_000.0, 0.0));
        broker.load_bars("AAPL", bars(100.0, 30)).await;
        broker
    }

    fn buy_signal() -> Signal {
        Signal::buy("AAPL", 100.0, 0.9, "test")
            .with_position_size(10.0)
            .with_stop_loss(95.0)
            .with_take_profit(110.0)
            .with_metadata(STRATEGY_KEY, "trend")
    }

    /// Acks every order as New and reports it filled after `fill_after` polls,
    /// or once `fill_now` is set. Cancelled orders report Canceled.
    struct SlowFill {
        polls: AtomicUsize,
        fill_after: Option<usize>,
        fill_now: AtomicBool,
        refuse_cancels: bool,
        submitted: Mutex<Vec<Order>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl SlowFill {
        fn new(fill_after: Option<usize>) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                fill_after,
                fill_now: AtomicBool::new(false),
                refuse_cancels: false,
                submitted: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
            }
        }

        fn refusing_cancels(mut self) -> Self {
            self.refuse_cancels = true;
            self
        }

        fn market_buys(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .filter(|o| o.side == OrderSide::Buy && o.order_type == OrderType::Market)
                .map(|o| o.id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Broker for SlowFill {
        fn name(&self) -> &str {
            "slow"
        }

        async fn get_account(&self) -> Result<Account> {
            Ok(Account {
                equity: 100_000.0,
                cash: 100_000.0,
                buying_power: 100_000.0,
                portfolio_value: 100_000.0,
                positions_count: 0,
            })
        }

        async fn get_positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }

        async fn get_market_data(&self, _symbol: &str, _limit: usize) -> Result<Vec<Bar>> {
            Ok(bars(100.0, 5))
        }

        async fn submit_order(&self, order: &Order) -> Result<OrderAck> {
            self.submitted.lock().unwrap().push(order.clone());
            Ok(OrderAck {
                id: order.id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                status: OrderStatus::New,
                filled_qty: 0.0,
                filled_avg_price: None,
            })
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let cancelled = self.cancelled.lock().unwrap().iter().any(|id| id == order_id);
            let filled = !cancelled
                && (self.fill_now.load(Ordering::SeqCst) || self.fill_after.is_some_and(|after| n >= after));
            let status = if cancelled {
                OrderStatus::Canceled
            } else if filled {
                OrderStatus::Filled
            } else {
                OrderStatus::New
            };
            Ok(OrderAck {
                id: order_id.into(),
                symbol: "AAPL".into(),
                side: OrderSide::Buy,
                status,
                filled_qty: if filled { 10.0 } else { 0.0 },
                filled_avg_price: filled.then_some(101.0),
            })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            if self.refuse_cancels {
                return Err(Error::Broker("order is not cancelable".into()));
            }
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
    }

    /// Paper broker whose market SELLs are rejected or fail outright.
    struct BrokenExits {
        inner: Arc<PaperBroker>,
        fail: bool,
    }

    #[async_trait]
    impl Broker for BrokenExits {
        fn name(&self) -> &str {
            "broken-exits"
        }

        async fn get_account(&self) -> Result<Account> {
            self.inner.get_account().await
        }

        async fn get_positions(&self) -> Result<Vec<Position>> {
            self.inner.get_positions().await
        }

        async fn get_market_data(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
            self.inner.get_market_data(symbol, limit).await
        }

        async fn submit_order(&self, order: &Order) -> Result<OrderAck> {
            if order.side != OrderSide::Sell || order.order_type != OrderType::Market {
                return self.inner.submit_order(order).await;
            }
            if self.fail {
                return Err(Error::Broker("connection reset".into()));
            }
            Ok(OrderAck {
                id: order.id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                status: OrderStatus::Rejected,
                filled_qty: 0.0,
                filled_avg_price: None,
            })
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
            self.inner.get_order(order_id).await
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            self.inner.cancel_order(order_id).await
        }
    }

    // ─── execute_signal ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn buy_fills_places_bracket_and_tags_position() {
        let dir = tempfile::tempdir().unwrap();
        let broker = paper().await;
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());

        let report = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.filled_qty, 10.0);
        assert_eq!(report.fill_price, Some(100.0));
        assert!(report.warnings.is_empty());

        let stop_id = report.stop_order_id.clone().unwrap();
        let stop = broker.get_order(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Accepted);
        assert!(report.take_profit_order_id.is_some());

        let tag = &bot.state().positions["AAPL"];
        assert_eq!(tag.strategy, "trend");
        assert_eq!(tag.quantity, 10.0);
        assert_eq!(tag.stop_order_id.as_deref(), Some(stop_id.as_str()));
        assert_eq!(bot.orchestrator().risk_manager().unwrap().trades_today(), 1);
    }

    #[tokio::test]
    async fn sell_cancels_bracket_and_closes_tag() {
        let dir = tempfile::tempdir().unwrap();
        let broker = paper().await;
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());
        let entry = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();

        let exit = Signal::sell("AAPL", 100.0, 0.7, "exit").with_metadata(STRATEGY_KEY, "trend");
        let report = bot.execute_signal(&exit).await.unwrap().unwrap();
        assert_eq!(report.filled_qty, 10.0);

        let stop = broker.get_order(&entry.stop_order_id.unwrap()).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Canceled);
        assert!(bot.state().positions.is_empty());
        assert!(broker.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hold_and_unheld_sell_do_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut bot = new_bot(&config(&dir, &["AAPL"]), paper().await);
        assert!(bot.execute_signal(&Signal::hold("AAPL", 100.0, "wait")).await.unwrap().is_none());
        assert!(bot.execute_signal(&Signal::sell("AAPL", 100.0, 0.5, "x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsized_buy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut bot = new_bot(&config(&dir, &["AAPL"]), paper().await);
        let err = bot
            .execute_signal(&Signal::buy("AAPL", 100.0, 0.9, "no size"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OrderRejected { .. }));
    }

    #[tokio::test]
    async fn delayed_fill_is_polled_until_observed() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SlowFill::new(Some(3)));
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone())
            .with_fill_timing(Duration::from_secs(5), Duration::from_millis(1));

        let report = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.fill_price, Some(101.0));
        assert_eq!(broker.polls.load(Ordering::SeqCst), 3);
        // Entry, stop, target.
        let submitted = broker.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[1].stop_price, Some(95.0));
        assert_eq!(submitted[2].limit_price, Some(110.0));
    }

    #[tokio::test]
    async fn unobserved_fill_cancels_entry_and_skips_bracket() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SlowFill::new(None));
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());

        let report = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();
        assert_eq!(report.status, OrderStatus::Canceled);
        assert!(!report.is_filled());
        assert!(report.stop_order_id.is_none());
        assert_eq!(report.warnings.len(), 1);
        assert!(bot.state().positions.is_empty());
        assert!(bot.state().pending_entries.is_empty());
        assert_eq!(broker.submitted.lock().unwrap().len(), 1);
        assert_eq!(*broker.cancelled.lock().unwrap(), vec![report.order_id]);
    }

    #[tokio::test]
    async fn unfilled_entry_never_stays_live_across_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SlowFill::new(None));
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());

        bot.run_strategy_cycle().await.unwrap();
        assert_eq!(broker.market_buys().len(), 1);
        assert_eq!(*broker.cancelled.lock().unwrap(), broker.market_buys());

        bot.run_strategy_cycle().await.unwrap();
        // The retry only happens after the first entry was pulled.
        let buys = broker.market_buys();
        assert_eq!(buys.len(), 2);
        assert_eq!(*broker.cancelled.lock().unwrap(), buys);
    }

    #[tokio::test]
    async fn uncancellable_entry_blocks_rebuy_until_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SlowFill::new(None).refusing_cancels());
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());

        bot.run_strategy_cycle().await.unwrap();
        bot.run_strategy_cycle().await.unwrap();
        let buys = broker.market_buys();
        assert_eq!(buys.len(), 1);
        assert_eq!(bot.state().pending_entries["AAPL"].order_id, buys[0]);
        assert!(bot.state().positions.is_empty());

        // The working order fills later; the next reconcile brackets it.
        broker.fill_now.store(true, Ordering::SeqCst);
        bot.reconcile_pending_entries().await;
        assert!(bot.state().pending_entries.is_empty());
        let tag = &bot.state().positions["AAPL"];
        assert_eq!(tag.quantity, 10.0);
        assert_eq!(tag.entry_price, 101.0);
        assert!(tag.stop_order_id.is_some());

        let submitted = broker.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 3);
        assert!((submitted[1].stop_price.unwrap() - 95.0).abs() < 1e-9);
        assert_eq!(submitted[1].quantity, 10.0);
        assert!((submitted[2].limit_price.unwrap() - 110.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_exit_restores_the_bracket() {
        for fail in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let paper = paper().await;
            let broker = Arc::new(BrokenExits {
                inner: paper.clone(),
                fail,
            });
            let mut bot = new_bot(&config(&dir, &["AAPL"]), broker);
            let entry = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();
            let old_stop = entry.stop_order_id.unwrap();

            let exit = Signal::sell("AAPL", 100.0, 0.7, "exit").with_metadata(STRATEGY_KEY, "trend");
            let outcome = bot.execute_signal(&exit).await;
            if fail {
                assert!(outcome.is_err());
            } else {
                let report = outcome.unwrap().unwrap();
                assert_eq!(report.status, OrderStatus::Rejected);
                assert_eq!(report.stop_order_id, bot.state().positions["AAPL"].stop_order_id);
            }

            assert_eq!(paper.get_order(&old_stop).await.unwrap().status, OrderStatus::Canceled);
            assert_eq!(paper.get_positions().await.unwrap()[0].quantity, 10.0);
            let tag = &bot.state().positions["AAPL"];
            assert_eq!(tag.quantity, 10.0);
            let new_stop = tag.stop_order_id.clone().unwrap();
            assert_ne!(new_stop, old_stop);
            let restored = paper.get_order(&new_stop).await.unwrap();
            assert_eq!(restored.status, OrderStatus::Accepted);
            let target = tag.take_profit_order_id.clone().unwrap();
            assert_eq!(paper.get_order(&target).await.unwrap().status, OrderStatus::Accepted);
        }
    }

    #[tokio::test]
    async fn partial_exit_rebrackets_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let broker = paper().await;
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());
        bot.execute_signal(&buy_signal()).await.unwrap().unwrap();

        let exit = Signal::sell("AAPL", 100.0, 0.7, "trim")
            .with_position_size(4.0)
            .with_metadata(STRATEGY_KEY, "trend");
        let report = bot.execute_signal(&exit).await.unwrap().unwrap();
        assert_eq!(report.filled_qty, 4.0);

        let tag = &bot.state().positions["AAPL"];
        assert_eq!(tag.quantity, 6.0);
        let stop_id = report.stop_order_id.unwrap();
        assert_eq!(tag.stop_order_id.as_deref(), Some(stop_id.as_str()));

        // The new stop covers exactly the six shares left.
        broker.load_bars("AAPL", bars(90.0, 30)).await;
        let stop = broker.get_order(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Filled);
        assert_eq!(stop.filled_qty, 6.0);
        assert!(broker.get_positions().await.unwrap().is_empty());
    }

    // ─── run_strategy_cycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn cycle_enters_once_then_sees_its_own_position() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, &["AAPL", "MSFT"]);
        let broker = paper().await;
        let mut bot = new_bot(&cfg, broker.clone());

        let first = bot.run_strategy_cycle().await.unwrap();
        assert_eq!(first.signals, 1);
        assert_eq!(first.executed.len(), 1);
        assert_eq!(first.symbols_skipped, vec!["MSFT".to_string()]);
        assert_eq!(first.symbols_loaded, 1);
        assert!(cfg.bot.state_path().exists());

        let second = bot.run_strategy_cycle().await.unwrap();
        assert_eq!(second.signals, 0);
        assert_eq!(second.open_positions, 1);

        // A restarted bot picks the tag back up from disk.
        let restarted = new_bot(&cfg, broker);
        assert_eq!(restarted.state().positions["AAPL"].strategy, "trend");
        assert!(restarted.state().last_cycle.is_some());
    }

    #[tokio::test]
    async fn stop_fill_cancels_the_orphaned_target() {
        let dir = tempfile::tempdir().unwrap();
        let broker = paper().await;
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker.clone());
        let entry = bot.execute_signal(&buy_signal()).await.unwrap().unwrap();
        let stop_id = entry.stop_order_id.unwrap();
        let target_id = entry.take_profit_order_id.unwrap();

        // Price falls through the stop between cycles.
        broker.load_bars("AAPL", bars(90.0, 30)).await;
        assert_eq!(broker.get_order(&stop_id).await.unwrap().status, OrderStatus::Filled);
        assert_eq!(broker.get_order(&target_id).await.unwrap().status, OrderStatus::Accepted);

        bot.run_strategy_cycle().await.unwrap();
        assert_eq!(broker.get_order(&target_id).await.unwrap().status, OrderStatus::Canceled);
        assert_eq!(broker.get_order(&stop_id).await.unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn cycle_without_any_data_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0, 0.0));
        let mut bot = new_bot(&config(&dir, &["AAPL"]), broker);
        assert!(bot.run_strategy_cycle().await.is_err());
    }
}
