use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{
    Account, Bar, Broker, Error, Order, OrderAck, OrderSide, OrderStatus, OrderType, Position, Result,
};

#[derive(Debug, Clone, Copy)]
struct Holding {
    quantity: f64,
    entry_price: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    cash: f64,
    holdings: BTreeMap<String, Holding>,
    orders: HashMap<String, OrderAck>,
    /// Stop and limit orders not yet triggered, in submission order.
    resting: Vec<Order>,
    bars: HashMap<String, Vec<Bar>>,
}

impl Ledger {
    fn last_price(&self, symbol: &str) -> Option<f64> {
        self.bars.get(symbol).and_then(|b| b.last()).map(|b| b.close)
    }

    /// Move cash and holdings for a fill at `price`. Buys beyond cash and
    /// sells beyond the holding are rejected.
    fn apply_fill(&mut self, order: &Order, price: f64) -> OrderStatus {
        let notional = price * order.quantity;
        match order.side {
            OrderSide::Buy if notional > self.cash => {
                warn!(symbol = %order.symbol, notional, cash = self.cash, "Paper buy rejected: insufficient cash");
                OrderStatus::Rejected
            }
            OrderSide::Buy => {
                self.cash -= notional;
                let h = self.holdings.entry(order.symbol.clone()).or_insert(Holding {
                    quantity: 0.0,
                    entry_price: price,
                });
                let total = h.quantity + order.quantity;
                h.entry_price = (h.entry_price * h.quantity + price * order.quantity) / total;
                h.quantity = total;
                OrderStatus::Filled
            }
            OrderSide::Sell => {
                let held = self.holdings.get(&order.symbol).map_or(0.0, |h| h.quantity);
                if order.quantity > held + 1e-9 {
                    warn!(symbol = %order.symbol, qty = order.quantity, held, "Paper sell rejected: exceeds holding");
                    return OrderStatus::Rejected;
                }
                self.cash += notional;
                let remaining = held - order.quantity;
                if remaining <= 1e-9 {
                    self.holdings.remove(&order.symbol);
                } else if let Some(h) = self.holdings.get_mut(&order.symbol) {
                    h.quantity = remaining;
                }
                OrderStatus::Filled
            }
        }
    }

    fn record(&mut self, order: &Order, status: OrderStatus, price: f64) -> OrderAck {
        let result = if status == OrderStatus::Filled {
            debug!(
                symbol = %order.symbol,
                side = %order.side,
                kind = ?order.order_type,
                fill = price,
                qty = order.quantity,
                "Paper fill simulated"
            );
            ack(order, status, order.quantity, Some(price))
        } else {
            ack(order, status, 0.0, None)
        };
        self.orders.insert(order.id.clone(), result.clone());
        result
    }

    /// Replace the series for `symbol` and fill any resting order its
    /// latest bar crosses.
    fn set_bars(&mut self, symbol: &str, bars: Vec<Bar>, slippage_bps: f64) {
        let latest = bars.last().cloned();
        self.bars.insert(symbol.to_string(), bars);
        let Some(bar) = latest else {
            return;
        };

        let (due, keep): (Vec<Order>, Vec<Order>) = std::mem::take(&mut self.resting)
            .into_iter()
            .partition(|o| o.symbol == symbol && trigger_price(o, &bar, slippage_bps).is_some());
        self.resting = keep;
        for order in due {
            let Some(price) = trigger_price(&order, &bar, slippage_bps) else {
                continue;
            };
            let status = self.apply_fill(&order, price);
            info!(symbol = %order.symbol, id = %order.id, kind = ?order.order_type, price, status = ?status, "Paper resting order triggered");
            self.record(&order, status, price);
        }
    }
}

/// Fill price if `bar` crosses the order's trigger. Gaps through the
/// trigger fill at the open.
fn trigger_price(order: &Order, bar: &Bar, slippage_bps: f64) -> Option<f64> {
    match (order.order_type, order.side) {
        (OrderType::Stop, OrderSide::Sell) => {
            let stop = order.stop_price?;
            (bar.low <= stop).then(|| slipped(OrderSide::Sell, bar.open.min(stop), slippage_bps))
        }
        (OrderType::Stop, OrderSide::Buy) => {
            let stop = order.stop_price?;
            (bar.high >= stop).then(|| slipped(OrderSide::Buy, bar.open.max(stop), slippage_bps))
        }
        (OrderType::Limit, OrderSide::Sell) => {
            let limit = order.limit_price?;
            (bar.high >= limit).then(|| bar.open.max(limit))
        }
        (OrderType::Limit, OrderSide::Buy) => {
            let limit = order.limit_price?;
            (bar.low <= limit).then(|| bar.open.min(limit))
        }
        (OrderType::Market, _) => None,
    }
}

fn slipped(side: OrderSide, mid: f64, slippage_bps: f64) -> f64 {
    match side {
        OrderSide::Buy => mid * (1.0 + slippage_bps / 10_000.0),
        OrderSide::Sell => mid * (1.0 - slippage_bps / 10_000.0),
    }
}

/// Simulated broker for paper trading.
///
/// Market orders fill immediately at the last close with configurable
/// slippage. Stop and limit orders rest until a new bar for their symbol
/// crosses the trigger, or until cancelled. Bars come from an optional
/// upstream feed or from `load_bars`.
pub struct PaperBroker {
    ledger: RwLock<Ledger>,
    feed: Option<Arc<dyn Broker>>,
    /// Slippage in basis points applied to market and stop fills.
    slippage_bps: f64,
}

impl PaperBroker {
    pub fn new(starting_cash: f64, slippage_bps: f64) -> Self {
        info!(cash = starting_cash, slippage_bps, "PaperBroker initialized");
        Self {
            ledger: RwLock::new(Ledger {
                cash: starting_cash,
                ..Ledger::default()
            }),
            feed: None,
            slippage_bps,
        }
    }

    /// Pull bars from `feed` instead of the locally loaded series.
    pub fn with_market_data(mut self, feed: Arc<dyn Broker>) -> Self {
        info!(feed = %feed.name(), "PaperBroker using upstream market data");
        self.feed = Some(feed);
        self
    }

    /// Replace the bar series for `symbol`. The last close is the fill price
    /// for market orders; the last bar is checked against resting orders.
    pub async fn load_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.ledger.write().await.set_bars(symbol, bars, self.slippage_bps);
    }
}

fn ack(order: &Order, status: OrderStatus, filled_qty: f64, price: Option<f64>) -> OrderAck {
    OrderAck {
        id: order.id.clone(),
        symbol: order.symbol.clone(),
        side: order.side,
        status,
        filled_qty,
        filled_avg_price: price,
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_account(&self) -> Result<Account> {
        let ledger = self.ledger.read().await;
        let market_value: f64 = ledger
            .holdings
            .iter()
            .map(|(symbol, h)| h.quantity * ledger.last_price(symbol).unwrap_or(h.entry_price))
            .sum();
        let equity = ledger.cash + market_value;
        Ok(Account {
            equity,
            cash: ledger.cash,
            buying_power: ledger.cash,
            portfolio_value: equity,
            positions_count: ledger.holdings.len(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .holdings
            .iter()
            .map(|(symbol, h)| {
                let current = ledger.last_price(symbol).unwrap_or(h.entry_price);
                Position::long(symbol.clone(), h.quantity, h.entry_price, current)
            })
            .collect())
    }

    async fn get_market_data(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        if let Some(feed) = &self.feed {
            let bars = feed.get_market_data(symbol, limit).await?;
            self.ledger.write().await.set_bars(symbol, bars.clone(), self.slippage_bps);
            return Ok(bars);
        }
        let ledger = self.ledger.read().await;
        let bars = ledger
            .bars
            .get(symbol)
            .ok_or_else(|| Error::Broker(format!("PaperBroker has no bars for '{symbol}'")))?;
        Ok(bars[bars.len().saturating_sub(limit)..].to_vec())
    }

    async fn submit_order(&self, order: &Order) -> Result<OrderAck> {
        if !(order.quantity > 0.0) {
            return Err(Error::Broker(format!("order quantity must be positive, got {}", order.quantity)));
        }
        let mut ledger = self.ledger.write().await;

        if order.order_type != OrderType::Market {
            let resting = ack(order, OrderStatus::Accepted, 0.0, None);
            debug!(symbol = %order.symbol, kind = ?order.order_type, id = %order.id, "Paper order resting");
            ledger.orders.insert(order.id.clone(), resting.clone());
            ledger.resting.push(order.clone());
            return Ok(resting);
        }

        let mid = ledger.last_price(&order.symbol).ok_or_else(|| {
            Error::Broker(format!("PaperBroker has no price for '{}'", order.symbol))
        })?;
        let fill_price = slipped(order.side, mid, self.slippage_bps);
        let status = ledger.apply_fill(order, fill_price);
        Ok(ledger.record(order, status, fill_price))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
        self.ledger
            .read()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("unknown paper order '{order_id}'")))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let order = ledger
            .orders
            .get_mut(order_id)
            .ok_or_else(|| Error::Broker(format!("unknown paper order '{order_id}'")))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Canceled;
        }
        ledger.resting.retain(|o| o.id != order_id);
        Ok(())
    }
}
