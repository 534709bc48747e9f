use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;

use crate::exchange::client::{
    AssetBalance, Balances, ExchangeClient, ExchangeError, Market, Order, OrderSide, OrderStatus,
    OrderType, Ticker,
};

const BINANCE_API_BASE: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5000;

type HmacSha256 = Hmac<Sha256>;

/// Client for the Binance spot REST API
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    markets: RwLock<HashMap<String, Market>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i32,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    order_id: u64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    transact_time: Option<i64>,
}

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("bad number in field {field}: {value}")))
}

/// Number of decimal places implied by a Binance filter step, e.g.
/// "0.00100000" -> 3, "1.00000000" -> 0
fn decimals_from_step(step: &str) -> u32 {
    match step.find('.') {
        Some(dot) => step[dot + 1..]
            .find('1')
            .map(|i| i as u32 + 1)
            .unwrap_or(0),
        None => 0,
    }
}

fn classify_api_error(code: i32, message: String) -> ExchangeError {
    match code {
        -2010 => ExchangeError::InsufficientBalance,
        -2011 | -2013 => ExchangeError::OrderNotFound(message),
        _ => ExchangeError::Api { code, message },
    }
}

impl RawOrder {
    fn into_order(self) -> Result<Order, ExchangeError> {
        let amount = parse_f64(&self.orig_qty, "origQty")?;
        let filled = parse_f64(&self.executed_qty, "executedQty")?;

        let average = match self.cummulative_quote_qty.as_deref() {
            Some(quote_qty) if filled > 0.0 => {
                Some(parse_f64(quote_qty, "cummulativeQuoteQty")? / filled)
            }
            _ => None,
        };

        let price = match self.price.as_deref() {
            Some(p) => {
                let parsed = parse_f64(p, "price")?;
                (parsed > 0.0).then_some(parsed)
            }
            None => None,
        };

        let stop_price = match self.stop_price.as_deref() {
            Some(p) => {
                let parsed = parse_f64(p, "stopPrice")?;
                (parsed > 0.0).then_some(parsed)
            }
            None => None,
        };

        let side = match self.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => return Err(ExchangeError::Parse(format!("unknown side: {other}"))),
        };

        let order_type = match self.order_type.as_str() {
            "MARKET" => OrderType::Market,
            "STOP_LOSS_LIMIT" | "STOP_LOSS" => OrderType::StopLossLimit,
            other => return Err(ExchangeError::Parse(format!("unknown order type: {other}"))),
        };

        let status = match self.status.as_str() {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            other => return Err(ExchangeError::Parse(format!("unknown status: {other}"))),
        };

        let ts_ms = self.time.or(self.transact_time).unwrap_or(0);
        let timestamp = DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);

        Ok(Order {
            id: self.order_id.to_string(),
            symbol: self.symbol,
            side,
            order_type,
            status,
            amount,
            filled,
            average,
            price,
            stop_price,
            timestamp,
        })
    }
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self::with_base_url(api_key, api_secret, BINANCE_API_BASE.to_string())
    }

    /// Point the client at a different base URL (testnet, mock server)
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            api_secret,
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// HMAC-SHA256 signature over the query string, hex encoded
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn handle_response(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => Err(classify_api_error(err.code, err.msg)),
            Err(_) => Err(ExchangeError::Parse(format!(
                "HTTP {status}: unrecognized error body: {body}"
            ))),
        }
    }

    async fn public_get(&self, path: &str, query: Option<String>) -> Result<String, ExchangeError> {
        let url = match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        };
        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<String, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", timestamp));

        let query = Self::build_query(&params);
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn place_order(&self, params: Vec<(&str, String)>) -> Result<Order, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::POST, "/api/v3/order", params)
            .await?;
        let raw: RawOrder =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        raw.into_order()
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn load_markets(&self) -> Result<(), ExchangeError> {
        let body = self.public_get("/api/v3/exchangeInfo", None).await?;
        let info: ExchangeInfoResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        let mut markets = HashMap::new();
        for symbol in info.symbols {
            if symbol.status != "TRADING" {
                continue;
            }

            let mut amount_precision = 8;
            let mut price_precision = 8;
            let mut min_amount = 0.0;

            for filter in &symbol.filters {
                match filter.filter_type.as_str() {
                    "LOT_SIZE" => {
                        if let Some(step) = &filter.step_size {
                            amount_precision = decimals_from_step(step);
                        }
                        if let Some(min_qty) = &filter.min_qty {
                            min_amount = parse_f64(min_qty, "minQty")?;
                        }
                    }
                    "PRICE_FILTER" => {
                        if let Some(tick) = &filter.tick_size {
                            price_precision = decimals_from_step(tick);
                        }
                    }
                    _ => {}
                }
            }

            markets.insert(
                symbol.symbol.clone(),
                Market {
                    symbol: symbol.symbol,
                    base: symbol.base_asset,
                    quote: symbol.quote_asset,
                    amount_precision,
                    price_precision,
                    min_amount,
                },
            );
        }

        tracing::info!("Loaded {} tradable markets", markets.len());
        *self.markets.write().unwrap() = markets;
        Ok(())
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.markets.read().unwrap().get(symbol).cloned()
    }

    async fn fetch_balance(&self) -> Result<Balances, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", Vec::new())
            .await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        let mut balances = Balances::new();
        for raw in account.balances {
            let free = parse_f64(&raw.free, "free")?;
            let locked = parse_f64(&raw.locked, "locked")?;
            if free > 0.0 || locked > 0.0 {
                balances.insert(raw.asset, AssetBalance { free, locked });
            }
        }
        Ok(balances)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let body = self
            .public_get(
                "/api/v3/ticker/price",
                Some(format!("symbol={symbol}")),
            )
            .await?;
        let raw: TickerResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        Ok(Ticker {
            symbol: raw.symbol,
            last: parse_f64(&raw.price, "price")?,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v3/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        let raw: Vec<RawOrder> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        raw.into_iter().map(RawOrder::into_order).collect()
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v3/order",
                vec![("symbol", symbol.to_string()), ("orderId", id.to_string())],
            )
            .await?;
        let raw: RawOrder =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        raw.into_order()
    }

    async fn create_market_buy_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError> {
        self.place_order(vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", amount.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ])
        .await
    }

    async fn create_market_sell_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError> {
        self.place_order(vec![
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", amount.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ])
        .await
    }

    async fn create_stop_loss_limit_order(
        &self,
        symbol: &str,
        amount: f64,
        limit_price: f64,
        stop_price: f64,
    ) -> Result<Order, ExchangeError> {
        self.place_order(vec![
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("type", "STOP_LOSS_LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", amount.to_string()),
            ("price", limit_price.to_string()),
            ("stopPrice", stop_price.to_string()),
        ])
        .await
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/api/v3/order",
            vec![("symbol", symbol.to_string()), ("orderId", id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn fetch_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        let body = self.public_get("/api/v3/time", None).await?;
        let raw: ServerTimeResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        DateTime::from_timestamp_millis(raw.server_time)
            .ok_or_else(|| ExchangeError::Parse(format!("bad server time: {}", raw.server_time)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(base_url: String) -> BinanceClient {
        BinanceClient::with_base_url("test-key".to_string(), "test-secret".to_string(), base_url)
    }

    #[test]
    fn test_decimals_from_step() {
        assert_eq!(decimals_from_step("0.00100000"), 3);
        assert_eq!(decimals_from_step("0.00001000"), 5);
        assert_eq!(decimals_from_step("1.00000000"), 0);
        assert_eq!(decimals_from_step("0.1"), 1);
    }

    #[test]
    fn test_classify_api_errors() {
        assert!(matches!(
            classify_api_error(-2010, "insufficient".to_string()),
            ExchangeError::InsufficientBalance
        ));
        assert!(matches!(
            classify_api_error(-2011, "unknown order".to_string()),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            classify_api_error(-1000, "oops".to_string()),
            ExchangeError::Api { code: -1000, .. }
        ));
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = test_client("http://unused".to_string());
        let sig = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1"));
        assert_ne!(sig, client.sign("symbol=ETHUSDT&timestamp=1"));
    }

    #[tokio::test]
    async fn test_fetch_ticker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/price?symbol=BTCUSDT")
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"50123.45"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let ticker = client.fetch_ticker("BTCUSDT").await.unwrap();

        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.last, 50123.45);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_load_markets_parses_filters() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{
            "symbols": [{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "LOT_SIZE", "stepSize": "0.00001000", "minQty": "0.00001000"},
                    {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"}
                ]
            }, {
                "symbol": "DEADUSDT",
                "status": "BREAK",
                "baseAsset": "DEAD",
                "quoteAsset": "USDT",
                "filters": []
            }]
        }"#;
        let _mock = server
            .mock("GET", "/api/v3/exchangeInfo")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = test_client(server.url());
        client.load_markets().await.unwrap();

        let market = client.market("BTCUSDT").unwrap();
        assert_eq!(market.base, "BTC");
        assert_eq!(market.quote, "USDT");
        assert_eq!(market.amount_precision, 5);
        assert_eq!(market.price_precision, 2);
        assert_eq!(market.min_amount, 0.00001);

        // Non-trading symbols are not loaded
        assert!(client.market("DEADUSDT").is_none());
    }

    #[tokio::test]
    async fn test_fetch_time() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/time")
            .with_status(200)
            .with_body(r#"{"serverTime":1700000000000}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let time = client.fetch_time().await.unwrap();
        assert_eq!(time.timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_api_error_classification_over_http() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price?symbol=NOPE")
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client.fetch_ticker("NOPE").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Api { code: -1121, .. }));
        assert!(!err.is_connectivity());
    }
}
