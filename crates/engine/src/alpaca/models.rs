use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Bar, Error, OrderAck, OrderSide, OrderStatus, Position, PositionSide, Result};

// ─── Responses ────────────────────────────────────────────────────────────────

/// Alpaca sends every numeric account field as a string.
#[derive(Debug, Deserialize)]
pub(crate) struct AccountResponse {
    pub equity: String,
    pub cash: String,
    pub buying_power: String,
    pub portfolio_value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PositionResponse {
    pub symbol: String,
    pub qty: String,
    pub avg_entry_price: String,
    pub current_price: String,
    pub market_value: String,
    pub unrealized_pl: String,
    pub unrealized_plpc: String,
    pub side: String,
}

impl PositionResponse {
    pub fn into_position(self) -> Result<Position> {
        let side = if self.side.eq_ignore_ascii_case("short") {
            PositionSide::Short
        } else {
            PositionSide::Long
        };
        Ok(Position {
            quantity: num(&self.qty, "qty")?.abs(),
            entry_price: num(&self.avg_entry_price, "avg_entry_price")?,
            current_price: num(&self.current_price, "current_price")?,
            market_value: num(&self.market_value, "market_value")?,
            unrealized_pl: num(&self.unrealized_pl, "unrealized_pl")?,
            unrealized_plpc: num(&self.unrealized_plpc, "unrealized_plpc")?,
            side,
            symbol: self.symbol,
            stop_loss: None,
            metadata: Default::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
}

impl OrderResponse {
    pub fn into_ack(self) -> Result<OrderAck> {
        let side = match self.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => return Err(Error::Broker(format!("unknown Alpaca order side '{other}'"))),
        };
        let filled_qty = match self.filled_qty.as_deref() {
            Some(q) => num(q, "filled_qty")?,
            None => 0.0,
        };
        let filled_avg_price = match self.filled_avg_price.as_deref() {
            Some(p) => Some(num(p, "filled_avg_price")?),
            None => None,
        };
        Ok(OrderAck {
            status: parse_status(&self.status),
            id: self.id,
            symbol: self.symbol,
            side,
            filled_qty,
            filled_avg_price,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<BarResponse>>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BarResponse {
    pub t: DateTime<Utc>,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl From<BarResponse> for Bar {
    fn from(b: BarResponse) -> Self {
        Bar {
            timestamp: b.t,
            open: b.o,
            high: b.h,
            low: b.l,
            close: b.c,
            volume: b.v,
        }
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: &'static str,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    pub client_order_id: String,
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn num(value: &str, field: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| Error::Broker(format!("Alpaca field '{field}' is not a number ('{value}'): {e}")))
}

pub(crate) fn parse_status(status: &str) -> OrderStatus {
    match status {
        "new" | "pending_new" | "accepted_for_bidding" => OrderStatus::New,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "pending_cancel" | "done_for_day" | "stopped" | "suspended" => OrderStatus::Canceled,
        "expired" => OrderStatus::Expired,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Accepted,
    }
}
