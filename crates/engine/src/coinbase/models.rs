use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use common::{Bar, Error, OrderStatus, Result};

/// Currencies treated as cash rather than positions.
pub(crate) const QUOTE_CURRENCIES: &[&str] = &["USD", "USDC"];

// ─── Accounts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct AccountsResponse {
    pub accounts: Vec<WalletResponse>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalletResponse {
    pub currency: String,
    pub available_balance: Amount,
    pub hold: Option<Amount>,
}

impl WalletResponse {
    /// Available plus on hold.
    pub fn total(&self) -> Result<f64> {
        let held = match &self.hold {
            Some(h) => h.parse()?,
            None => 0.0,
        };
        Ok(self.available_balance.parse()? + held)
    }

    pub fn is_quote(&self) -> bool {
        QUOTE_CURRENCIES.contains(&self.currency.as_str())
    }

    pub fn product_id(&self) -> String {
        format!("{}-USD", self.currency)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Amount {
    pub value: String,
}

impl Amount {
    fn parse(&self) -> Result<f64> {
        num(&self.value, "balance")
    }
}

// ─── Market data ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ProductResponse {
    pub price: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CandlesResponse {
    pub candles: Vec<CandleResponse>,
}

/// Every field is a decimal string; `start` is unix seconds.
#[derive(Debug, Deserialize)]
pub(crate) struct CandleResponse {
    pub start: String,
    pub low: String,
    pub high: String,
    pub open: String,
    pub close: String,
    pub volume: String,
}

impl CandleResponse {
    pub fn into_bar(self) -> Result<Bar> {
        let secs: i64 = self
            .start
            .parse()
            .map_err(|e| Error::Broker(format!("bad candle start '{}': {e}", self.start)))?;
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::Broker(format!("candle start out of range: {secs}")))?;
        Ok(Bar {
            timestamp,
            open: num(&self.open, "open")?,
            high: num(&self.high, "high")?,
            low: num(&self.low, "low")?,
            close: num(&self.close, "close")?,
            volume: num(&self.volume, "volume")?,
        })
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct CreateOrderRequest {
    pub client_order_id: String,
    pub product_id: String,
    pub side: &'static str,
    pub order_configuration: OrderConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OrderConfiguration {
    MarketMarketIoc {
        base_size: String,
    },
    LimitLimitGtc {
        base_size: String,
        limit_price: String,
        post_only: bool,
    },
    StopLimitStopLimitGtc {
        base_size: String,
        limit_price: String,
        stop_price: String,
        stop_direction: &'static str,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateOrderResponse {
    pub success: bool,
    pub success_response: Option<CreatedOrder>,
    pub error_response: Option<OrderError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedOrder {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrderError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoricalOrderResponse {
    pub order: HistoricalOrder,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoricalOrder {
    pub order_id: String,
    pub product_id: String,
    pub side: String,
    pub status: String,
    #[serde(default)]
    pub filled_size: Option<String>,
    #[serde(default)]
    pub average_filled_price: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchCancelRequest {
    pub order_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchCancelResponse {
    pub results: Vec<CancelResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelResult {
    pub success: bool,
    #[serde(default)]
    pub failure_reason: String,
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn num(value: &str, field: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| Error::Broker(format!("Coinbase field '{field}' is not a number ('{value}'): {e}")))
}

/// Empty strings mean "not yet" on Coinbase order payloads.
pub(crate) fn opt_num(value: Option<&str>, field: &str) -> Result<Option<f64>> {
    match value {
        Some(v) if !v.is_empty() => num(v, field).map(Some),
        _ => Ok(None),
    }
}

pub(crate) fn parse_status(status: &str) -> OrderStatus {
    match status {
        "PENDING" | "QUEUED" => OrderStatus::New,
        "OPEN" => OrderStatus::Accepted,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "CANCEL_QUEUED" => OrderStatus::Canceled,
        "EXPIRED" => OrderStatus::Expired,
        "FAILED" => OrderStatus::Rejected,
        _ => OrderStatus::Accepted,
    }
}
