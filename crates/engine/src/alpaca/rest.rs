use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use common::{
    Account, Bar, Broker, Credentials, Error, Order, OrderAck, OrderSide, OrderType, Position, Result,
    TradingMode,
};

use super::models::{
    num, AccountResponse, BarsResponse, OrderRequest, OrderResponse, PositionResponse,
};

const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

/// REST client for the Alpaca Trading and Market Data APIs.
pub struct AlpacaBroker {
    http: Client,
    api_key: String,
    secret: String,
    base_url: String,
    data_url: String,
}

impl AlpacaBroker {
    /// Endpoint defaults follow `mode`; credentials may override both.
    pub fn new(credentials: &Credentials, mode: TradingMode) -> Result<Self> {
        let default_base = match mode {
            TradingMode::Paper => PAPER_URL,
            TradingMode::Live => LIVE_URL,
        };
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url = credentials.base_url.as_deref().unwrap_or(default_base);
        info!(base_url, %mode, "AlpacaBroker initialized");
        Ok(Self {
            http,
            api_key: credentials.api_key.clone(),
            secret: credentials.secret.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: credentials
                .data_url
                .as_deref()
                .unwrap_or(DATA_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("Alpaca HTTP {status}: {body}")));
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn order_request(order: &Order) -> Result<OrderRequest> {
        let (order_type, time_in_force) = match order.order_type {
            OrderType::Market => ("market", "day"),
            OrderType::Limit => ("limit", "gtc"),
            OrderType::Stop => ("stop", "gtc"),
        };
        let price = |p: Option<f64>, what: &str| {
            p.map(format_price)
                .ok_or_else(|| Error::Broker(format!("{what} order for {} has no price", order.symbol)))
        };
        Ok(OrderRequest {
            symbol: order.symbol.clone(),
            qty: order.quantity.to_string(),
            side: match order.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            order_type,
            time_in_force,
            limit_price: match order.order_type {
                OrderType::Limit => Some(price(order.limit_price, "limit")?),
                _ => None,
            },
            stop_price: match order.order_type {
                OrderType::Stop => Some(price(order.stop_price, "stop")?),
                _ => None,
            },
            client_order_id: order.id.clone(),
        })
    }
}

/// Alpaca accepts cents at or above $1 and up to four decimals below it.
fn format_price(price: f64) -> String {
    if price >= 1.0 {
        format!("{price:.2}")
    } else {
        format!("{price:.4}")
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    fn name(&self) -> &str {
        "alpaca"
    }

    async fn get_account(&self) -> Result<Account> {
        let url = format!("{}/v2/account", self.base_url);
        let a: AccountResponse = self.send(self.http.get(&url)).await?;
        let equity = num(&a.equity, "equity")?;
        Ok(Account {
            equity,
            cash: num(&a.cash, "cash")?,
            buying_power: num(&a.buying_power, "buying_power")?,
            portfolio_value: match a.portfolio_value.as_deref() {
                Some(v) => num(v, "portfolio_value")?,
                None => equity,
            },
            positions_count: 0,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.base_url);
        let raw: Vec<PositionResponse> = self.send(self.http.get(&url)).await?;
        raw.into_iter().map(PositionResponse::into_position).collect()
    }

    async fn get_market_data(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        // Calendar window wide enough to cover `limit` trading days.
        let start = Utc::now() - chrono::Duration::days((limit as i64) * 3 / 2 + 10);
        let url = format!("{}/v2/stocks/{symbol}/bars", self.data_url);
        let mut bars: Vec<Bar> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeframe", "1Day".to_string()),
                ("start", start.to_rfc3339()),
                ("limit", "10000".to_string()),
                ("adjustment", "raw".to_string()),
                ("feed", "iex".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }
            let page: BarsResponse = self.send(self.http.get(&url).query(&query)).await?;
            bars.extend(page.bars.unwrap_or_default().into_iter().map(Bar::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(symbol, count = bars.len(), "Fetched Alpaca bars");
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.split_off(skip))
    }

    async fn submit_order(&self, order: &Order) -> Result<OrderAck> {
        let url = format!("{}/v2/orders", self.base_url);
        let body = Self::order_request(order)?;
        debug!(symbol = %order.symbol, side = %order.side, kind = ?order.order_type, qty = order.quantity, "Submitting order to Alpaca");
        let resp: OrderResponse = self.send(self.http.post(&url).json(&body)).await?;
        resp.into_ack()
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        let resp: OrderResponse = self.send(self.http.get(&url)).await?;
        resp.into_ack()
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        let resp = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Broker(format!("Alpaca cancel HTTP {status}: {body}")));
        }
        Ok(())
    }
}
