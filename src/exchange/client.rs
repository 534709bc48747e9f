use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from exchange operations.
///
/// The engine cares about one distinction above all: connectivity failures
/// (retried by re-probing on the next tick) versus everything else (the
/// specific action is aborted and logged). `is_connectivity` encodes it.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure: unreachable, timeout, connection reset
    #[error("network error: {0}")]
    Network(String),

    /// Error returned by the exchange itself
    #[error("exchange API error {code}: {message}")]
    Api { code: i32, message: String },

    /// Order id unknown to the exchange (or already cancelled)
    #[error("order {0} not found")]
    OrderNotFound(String),

    /// Not enough balance to place the order
    #[error("insufficient balance")]
    InsufficientBalance,

    /// Symbol missing from the loaded markets
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    /// Response body did not match the expected shape
    #[error("failed to parse exchange response: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// True for "order is already gone" conditions, which close/cancel
    /// paths deliberately ignore
    pub fn is_order_gone(&self) -> bool {
        matches!(self, Self::OrderNotFound(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    StopLossLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }
}

/// Exchange order as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub amount: f64,
    pub filled: f64,
    /// Average fill price, present once anything filled
    pub average: Option<f64>,
    /// Limit price for limit-type orders
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: f64,
    pub locked: f64,
}

pub type Balances = HashMap<String, AssetBalance>;

/// Tradable market metadata, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    /// Decimal places allowed in order quantity
    pub amount_precision: u32,
    /// Decimal places allowed in order price
    pub price_precision: u32,
    /// Minimum order quantity accepted by the venue
    pub min_amount: f64,
}

impl Market {
    /// Truncate a quantity to the market's amount precision (round down,
    /// never up past what we can afford)
    pub fn amount_to_precision(&self, amount: f64) -> f64 {
        let factor = 10f64.powi(self.amount_precision as i32);
        (amount * factor).floor() / factor
    }

    /// Round a price to the market's price precision
    pub fn price_to_precision(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.price_precision as i32);
        (price * factor).round() / factor
    }
}

/// The minimal exchange surface the engine consumes.
///
/// Implemented by [`crate::exchange::BinanceClient`] for live trading and by
/// [`crate::exchange::PaperExchange`] for dry runs and tests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fetch and cache market metadata for all tradable symbols
    async fn load_markets(&self) -> Result<(), ExchangeError>;

    /// Cached market metadata for a symbol, if loaded
    fn market(&self, symbol: &str) -> Option<Market>;

    async fn fetch_balance(&self) -> Result<Balances, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError>;

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<Order, ExchangeError>;

    async fn create_market_buy_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError>;

    async fn create_market_sell_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError>;

    /// Place a GTC stop-loss-limit sell order
    async fn create_stop_loss_limit_order(
        &self,
        symbol: &str,
        amount: f64,
        limit_price: f64,
        stop_price: f64,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError>;

    /// Server time; doubles as the cheapest connectivity probe
    async fn fetch_time(&self) -> Result<DateTime<Utc>, ExchangeError>;

    fn amount_to_precision(&self, symbol: &str, amount: f64) -> Result<f64, ExchangeError> {
        self.market(symbol)
            .map(|m| m.amount_to_precision(amount))
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.to_string()))
    }

    fn price_to_precision(&self, symbol: &str, price: f64) -> Result<f64, ExchangeError> {
        self.market(symbol)
            .map(|m| m.price_to_precision(price))
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.to_string()))
    }
}
