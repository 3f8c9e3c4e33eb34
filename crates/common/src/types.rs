use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Open key-value map attached to signals and positions.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata key under which the owning strategy name is stored.
pub const STRATEGY_KEY: &str = "strategy";

// ─── Market data ──────────────────────────────────────────────────────────────

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bars per symbol for one trading cycle, oldest bar first.
///
/// Backed by an ordered map so iteration (and therefore "first available
/// symbol") is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    bars: BTreeMap<String, Vec<Bar>>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, bars: Vec<Bar>) {
        self.bars.insert(symbol.into(), bars);
    }

    pub fn bars(&self, symbol: &str) -> Option<&[Bar]> {
        self.bars.get(symbol).map(Vec::as_slice)
    }

    pub fn closes(&self, symbol: &str) -> Option<Vec<f64>> {
        self.bars(symbol)
            .map(|bars| bars.iter().map(|b| b.close).collect())
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.bars(symbol).and_then(|b| b.last()).map(|b| b.close)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.bars.keys().map(String::as_str)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.bars.contains_key(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

// ─── Signals ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Buy => write!(f, "BUY"),
            SignalType::Sell => write!(f, "SELL"),
            SignalType::Hold => write!(f, "HOLD"),
        }
    }
}

/// A trading intent produced by a strategy.
///
/// Strategies create signals fresh on every invocation. Downstream layers
/// only add provenance to `metadata` and (for regime scaling) adjust
/// `position_size` before the signal is consumed by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub reason: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Quantity in base units (shares, coins).
    pub position_size: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Signal {
    pub fn new(
        signal_type: SignalType,
        symbol: impl Into<String>,
        price: f64,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            signal_type,
            symbol: symbol.into(),
            timestamp: Utc::now(),
            price,
            confidence,
            reason: reason.into(),
            stop_loss: None,
            take_profit: None,
            position_size: None,
            metadata: Metadata::new(),
        }
    }

    pub fn buy(symbol: impl Into<String>, price: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self::new(SignalType::Buy, symbol, price, confidence, reason)
    }

    pub fn sell(symbol: impl Into<String>, price: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self::new(SignalType::Sell, symbol, price, confidence, reason)
    }

    pub fn hold(symbol: impl Into<String>, price: f64, reason: impl Into<String>) -> Self {
        Self::new(SignalType::Hold, symbol, price, 0.0, reason)
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_position_size(mut self, size: f64) -> Self {
        self.position_size = Some(size);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Name of the strategy that produced this signal, once tagged.
    pub fn strategy(&self) -> Option<&str> {
        self.metadata.get(STRATEGY_KEY).and_then(Value::as_str)
    }

    pub fn is_buy(&self) -> bool {
        self.signal_type == SignalType::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.signal_type == SignalType::Sell
    }

    /// `price * position_size`, zero when unsized.
    pub fn notional(&self) -> f64 {
        self.price * self.position_size.unwrap_or(0.0)
    }
}

// ─── Account & positions ──────────────────────────────────────────────────────

/// Per-cycle snapshot of the broker account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub positions_count: usize,
}

impl Account {
    /// A virtual account holding `fraction` of this one's capital.
    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            equity: self.equity * fraction,
            cash: self.cash * fraction,
            buying_power: self.buying_power * fraction,
            portfolio_value: self.portfolio_value * fraction,
            positions_count: self.positions_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[default]
    Long,
    Short,
}

/// Broker-reported open position, enriched with the bot's own tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pl: f64,
    pub unrealized_plpc: f64,
    pub side: PositionSide,
    /// Protective stop recorded when the position was opened, if known.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Position {
    /// Long position with market value and P&L derived from the two prices.
    pub fn long(symbol: impl Into<String>, quantity: f64, entry_price: f64, current_price: f64) -> Self {
        let market_value = quantity * current_price;
        let cost = quantity * entry_price;
        let unrealized_pl = market_value - cost;
        let unrealized_plpc = if cost != 0.0 { unrealized_pl / cost } else { 0.0 };
        Self {
            symbol: symbol.into(),
            quantity,
            entry_price,
            current_price,
            market_value,
            unrealized_pl,
            unrealized_plpc,
            side: PositionSide::Long,
            stop_loss: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.metadata
            .insert(STRATEGY_KEY.to_string(), Value::String(strategy.into()));
        self
    }

    pub fn strategy(&self) -> Option<&str> {
        self.metadata.get(STRATEGY_KEY).and_then(Value::as_str)
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// No further fills can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// An order to be submitted to a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Client-side id, sent to brokers that accept one.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price for `Limit` orders.
    pub limit_price: Option<f64>,
    /// Trigger price for `Stop` orders.
    pub stop_price: Option<f64>,
}

impl Order {
    fn with_type(symbol: impl Into<String>, side: OrderSide, order_type: OrderType, quantity: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self::with_type(symbol, side, OrderType::Market, quantity)
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, limit_price: f64) -> Self {
        let mut order = Self::with_type(symbol, side, OrderType::Limit, quantity);
        order.limit_price = Some(limit_price);
        order
    }

    pub fn stop(symbol: impl Into<String>, side: OrderSide, quantity: f64, stop_price: f64) -> Self {
        let mut order = Self::with_type(symbol, side, OrderType::Stop, quantity);
        order.stop_price = Some(stop_price);
        order
    }
}

/// Broker view of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Broker-assigned id, used for status polling.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
}

// ─── Capital allocation ───────────────────────────────────────────────────────

/// Allowed deviation of the allocation total from 1.0.
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

/// Strategy name → fraction of account equity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapitalAllocation(BTreeMap<String, f64>);

impl CapitalAllocation {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self(weights)
    }

    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn equal_weight<S: AsRef<str>>(names: &[S]) -> Self {
        if names.is_empty() {
            return Self::default();
        }
        let w = 1.0 / names.len() as f64;
        Self(names.iter().map(|n| (n.as_ref().to_string(), w)).collect())
    }

    /// Fraction for `strategy`, zero when it has no allocation.
    pub fn fraction(&self, strategy: &str) -> f64 {
        self.0.get(strategy).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some((name, w)) = self.iter().find(|(_, w)| !(0.0..=1.0).contains(w)) {
            return Err(Error::Config(format!(
                "allocation for '{name}' must be within [0, 1], got {w}"
            )));
        }
        let total = self.total();
        if (total - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(Error::Config(format!(
                "capital allocation must sum to 1.0 (±{ALLOCATION_TOLERANCE}), got {total:.4}"
            )));
        }
        Ok(())
    }

    /// Keep only `names` and renormalize to 1.0. Falls back to equal
    /// weight when none of `names` carry any weight.
    pub fn restricted_to<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let kept: BTreeMap<String, f64> = names
            .iter()
            .map(|n| (n.as_ref().to_string(), self.fraction(n.as_ref())))
            .collect();
        let total: f64 = kept.values().sum();
        if total <= 0.0 {
            return Self::equal_weight(names);
        }
        Self(kept.into_iter().map(|(k, v)| (k, v / total)).collect())
    }
}

// ─── Risk ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerStatus {
    #[default]
    Normal,
    Warning,
    Triggered,
}

impl std::fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerStatus::Normal => write!(f, "NORMAL"),
            CircuitBreakerStatus::Warning => write!(f, "WARNING"),
            CircuitBreakerStatus::Triggered => write!(f, "TRIGGERED"),
        }
    }
}

/// Reason a signal was rejected by the Risk Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    CircuitBreaker { status: CircuitBreakerStatus },
    DailyTradeLimit { trades: u32, limit: u32 },
    MaxOpenPositions { open: usize, limit: usize },
    PortfolioHeat { heat: f64, limit: f64 },
    Correlation { symbol: String, held: String, correlation: f64, limit: f64 },
    SectorExposure { sector: String, exposure: f64, limit: f64 },
    InvalidSignal(String),
    Other(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::CircuitBreaker { status } => {
                write!(f, "circuit breaker {status}: new entries blocked")
            }
            RejectionReason::DailyTradeLimit { trades, limit } => {
                write!(f, "daily trade limit reached ({trades}/{limit})")
            }
            RejectionReason::MaxOpenPositions { open, limit } => {
                write!(f, "max open positions reached ({open}/{limit})")
            }
            RejectionReason::PortfolioHeat { heat, limit } => write!(
                f,
                "portfolio heat {:.2}% would exceed limit {:.2}%",
                heat * 100.0,
                limit * 100.0
            ),
            RejectionReason::Correlation { symbol, held, correlation, limit } => write!(
                f,
                "{symbol} correlation with held {held} is {correlation:.2} (limit {limit:.2})"
            ),
            RejectionReason::SectorExposure { sector, exposure, limit } => write!(
                f,
                "{sector} sector exposure {:.1}% would exceed limit {:.1}%",
                exposure * 100.0,
                limit * 100.0
            ),
            RejectionReason::InvalidSignal(s) => write!(f, "invalid signal: {s}"),
            RejectionReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Whether the bot is running against a real broker account or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    #[default]
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
