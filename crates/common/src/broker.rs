use async_trait::async_trait;

use crate::{Account, Bar, Order, OrderAck, Position, Result};

/// Abstraction over a broker connection.
///
/// `AlpacaBroker` and `CoinbaseBroker` implement this against their REST
/// APIs, `PaperBroker` for simulation. Implementations convert raw API
/// payloads into these types on ingress; nothing above this trait sees
/// broker-specific JSON.
///
/// Only `TradingBot` in `crates/engine` holds a `dyn Broker`. Every signal
/// goes through the orchestrator and its risk manager before reaching it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker name for logging.
    fn name(&self) -> &str;

    async fn get_account(&self) -> Result<Account>;

    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// Up to `limit` most recent daily bars for `symbol`, oldest first.
    async fn get_market_data(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>>;

    /// Submit an order and return the broker's acknowledgement. Market
    /// orders may or may not already be filled in the returned ack.
    async fn submit_order(&self, order: &Order) -> Result<OrderAck>;

    /// Current state of a previously submitted order.
    async fn get_order(&self, order_id: &str) -> Result<OrderAck>;

    /// Cancel an open order. Used to pull resting bracket orders before an exit.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}
