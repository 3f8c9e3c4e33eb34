use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, warn};

use common::{
    Account, Bar, Broker, Credentials, Error, Order, OrderAck, OrderSide, OrderStatus, OrderType, Position,
    Result,
};

use super::models::{
    num, opt_num, parse_status, AccountsResponse, BatchCancelRequest, BatchCancelResponse, CandlesResponse,
    CreateOrderRequest, CreateOrderResponse, HistoricalOrderResponse, OrderConfiguration, ProductResponse,
    WalletResponse,
};

const BASE_URL: &str = "https://api.coinbase.com";
const API_PREFIX: &str = "/api/v3/brokerage";
/// The candles endpoint returns at most 350 buckets per request.
const MAX_CANDLES: usize = 300;
/// Stop-limit orders rest their limit this far beyond the trigger.
const STOP_LIMIT_BUFFER: f64 = 0.005;

/// HMAC-SHA256 over `timestamp + method + path + body`, hex encoded.
pub fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| Error::Config(format!("bad Coinbase secret: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Decimal string without trailing zeros, as Coinbase expects sizes and prices.
fn decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// REST client for the Coinbase Advanced Trade API. Spot only; every
/// product is quoted in USD.
pub struct CoinbaseBroker {
    http: Client,
    api_key: String,
    secret: String,
    base_url: String,
}

impl CoinbaseBroker {
    pub fn new(credentials: &Credentials) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url = credentials
            .base_url
            .as_deref()
            .unwrap_or(BASE_URL)
            .trim_end_matches('/')
            .to_string();
        info!(base_url = %base_url, "CoinbaseBroker initialized");
        Ok(Self {
            http,
            api_key: credentials.api_key.clone(),
            secret: credentials.secret.clone(),
            base_url,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<T> {
        let signed_path = format!("{API_PREFIX}{path}");
        let ts = Utc::now().timestamp().to_string();
        let body = body.unwrap_or_default();
        let signature = sign(&self.secret, &ts, method.as_str(), &signed_path, &body)?;

        let mut req = self
            .http
            .request(method, format!("{}{signed_path}", self.base_url))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", ts);
        if !query.is_empty() {
            req = req.query(query);
        }
        if !body.is_empty() {
            req = req.header("Content-Type", "application/json").body(body);
        }

        let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("Coinbase HTTP {status}: {text}")));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn wallets(&self) -> Result<Vec<WalletResponse>> {
        let mut wallets = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![("limit", "250".to_string())];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }
            let page: AccountsResponse = self.request(Method::GET, "/accounts", &query, None).await?;
            wallets.extend(page.accounts);
            if !page.has_next || page.cursor.is_empty() {
                return Ok(wallets);
            }
            cursor = page.cursor;
        }
    }

    async fn price(&self, product_id: &str) -> Result<f64> {
        let p: ProductResponse = self
            .request(Method::GET, &format!("/products/{product_id}"), &[], None)
            .await?;
        num(&p.price, "price")
    }

    fn order_configuration(order: &Order) -> Result<OrderConfiguration> {
        let base_size = decimal(order.quantity);
        let missing = |what: &str| Error::Broker(format!("{what} order for {} has no price", order.symbol));
        Ok(match order.order_type {
            OrderType::Market => OrderConfiguration::MarketMarketIoc { base_size },
            OrderType::Limit => OrderConfiguration::LimitLimitGtc {
                base_size,
                limit_price: decimal(order.limit_price.ok_or_else(|| missing("limit"))?),
                post_only: false,
            },
            OrderType::Stop => {
                let stop = order.stop_price.ok_or_else(|| missing("stop"))?;
                let (limit, direction) = match order.side {
                    OrderSide::Sell => (stop * (1.0 - STOP_LIMIT_BUFFER), "STOP_DIRECTION_STOP_DOWN"),
                    OrderSide::Buy => (stop * (1.0 + STOP_LIMIT_BUFFER), "STOP_DIRECTION_STOP_UP"),
                };
                OrderConfiguration::StopLimitStopLimitGtc {
                    base_size,
                    limit_price: decimal(limit),
                    stop_price: decimal(stop),
                    stop_direction: direction,
                }
            }
        })
    }
}

#[async_trait]
impl Broker for CoinbaseBroker {
    fn name(&self) -> &str {
        "coinbase"
    }

    async fn get_account(&self) -> Result<Account> {
        let wallets = self.wallets().await?;
        let mut cash = 0.0;
        let mut available = 0.0;
        for w in wallets.iter().filter(|w| w.is_quote()) {
            cash += w.total()?;
            available += num(&w.available_balance.value, "available_balance")?;
        }
        let positions = self.get_positions().await?;
        let held: f64 = positions.iter().map(|p| p.market_value).sum();
        let equity = cash + held;
        Ok(Account {
            equity,
            cash,
            buying_power: available,
            portfolio_value: equity,
            positions_count: positions.len(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let mut positions = Vec::new();
        for wallet in self.wallets().await?.into_iter().filter(|w| !w.is_quote()) {
            let quantity = wallet.total()?;
            if quantity <= 1e-9 {
                continue;
            }
            let product_id = wallet.product_id();
            match self.price(&product_id).await {
                // Coinbase reports no cost basis; the bot state supplies it
                // for positions the bot opened.
                Ok(price) => positions.push(Position::long(product_id, quantity, price, price)),
                Err(e) => warn!(product = %product_id, error = %e, "No USD price for balance, skipped"),
            }
        }
        Ok(positions)
    }

    async fn get_market_data(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        let path = format!("/products/{symbol}/candles");
        let mut end = Utc::now();
        let mut bars: Vec<Bar> = Vec::new();
        let mut remaining = limit;

        while remaining > 0 {
            let chunk = remaining.min(MAX_CANDLES);
            let start = end - chrono::Duration::days(chunk as i64);
            let query = [
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("granularity", "ONE_DAY".to_string()),
            ];
            let resp: CandlesResponse = self.request(Method::GET, &path, &query, None).await?;
            if resp.candles.is_empty() {
                break;
            }
            for candle in resp.candles {
                bars.push(candle.into_bar()?);
            }
            remaining = remaining.saturating_sub(chunk);
            end = start;
        }

        // Newest first on the wire.
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        debug!(symbol, count = bars.len(), "Fetched Coinbase candles");
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.split_off(skip))
    }

    async fn submit_order(&self, order: &Order) -> Result<OrderAck> {
        let req = CreateOrderRequest {
            client_order_id: order.id.clone(),
            product_id: order.symbol.clone(),
            side: match order.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            },
            order_configuration: Self::order_configuration(order)?,
        };
        let body = serde_json::to_string(&req)?;
        debug!(symbol = %order.symbol, side = %order.side, kind = ?order.order_type, qty = order.quantity, "Submitting order to Coinbase");

        let resp: CreateOrderResponse = self.request(Method::POST, "/orders", &[], Some(body)).await?;
        match (resp.success, resp.success_response) {
            (true, Some(created)) => Ok(OrderAck {
                id: created.order_id,
                symbol: order.symbol.clone(),
                side: order.side,
                status: OrderStatus::New,
                filled_qty: 0.0,
                filled_avg_price: None,
            }),
            _ => {
                let detail = resp
                    .error_response
                    .map(|e| format!("{}: {}", e.error, e.message))
                    .unwrap_or_else(|| "no error detail".into());
                Err(Error::Broker(format!("Coinbase rejected order for {}: {detail}", order.symbol)))
            }
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
        let resp: HistoricalOrderResponse = self
            .request(Method::GET, &format!("/orders/historical/{order_id}"), &[], None)
            .await?;
        let o = resp.order;
        let side = match o.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => return Err(Error::Broker(format!("unknown Coinbase order side '{other}'"))),
        };
        Ok(OrderAck {
            status: parse_status(&o.status),
            filled_qty: opt_num(o.filled_size.as_deref(), "filled_size")?.unwrap_or(0.0),
            filled_avg_price: opt_num(o.average_filled_price.as_deref(), "average_filled_price")?,
            id: o.order_id,
            symbol: o.product_id,
            side,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let body = serde_json::to_string(&BatchCancelRequest {
            order_ids: vec![order_id.to_string()],
        })?;
        let resp: BatchCancelResponse = self
            .request(Method::POST, "/orders/batch_cancel", &[], Some(body))
            .await?;
        match resp.results.first() {
            Some(r) if r.success => Ok(()),
            Some(r) => Err(Error::Broker(format!("Coinbase cancel of {order_id} failed: {}", r.failure_reason))),
            None => Err(Error::Broker(format!("Coinbase cancel of {order_id} returned no result"))),
        }
    }
}
