use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::exchange::client::{
    AssetBalance, Balances, ExchangeClient, ExchangeError, Market, Order, OrderSide, OrderStatus,
    OrderType, Ticker,
};

const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "FDUSD", "BUSD", "BTC", "ETH"];

/// In-memory exchange for dry runs and deterministic tests.
///
/// Market orders fill instantly at the scripted price unless fills are
/// deferred; failure modes (offline, rejected orders, rejected stops) can be
/// toggled to exercise the engine's error paths.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

struct PaperState {
    markets: HashMap<String, Market>,
    prices: HashMap<String, f64>,
    balances: Balances,
    orders: HashMap<String, Order>,
    next_id: u64,
    offline: bool,
    reject_orders: bool,
    reject_stop_orders: bool,
    defer_fills: bool,
    fill_deferred_on_fetch: bool,
    /// Relative price offset applied to market fills (slippage simulation)
    fill_offset: f64,
}

impl PaperExchange {
    pub fn new(market: Market, price: f64, quote_balance: f64) -> Self {
        let mut markets = HashMap::new();
        let mut prices = HashMap::new();
        let mut balances = Balances::new();

        prices.insert(market.symbol.clone(), price);
        balances.insert(
            market.quote.clone(),
            AssetBalance {
                free: quote_balance,
                locked: 0.0,
            },
        );
        markets.insert(market.symbol.clone(), market);

        Self {
            state: Mutex::new(PaperState {
                markets,
                prices,
                balances,
                orders: HashMap::new(),
                next_id: 1,
                offline: false,
                reject_orders: false,
                reject_stop_orders: false,
                defer_fills: false,
                fill_deferred_on_fetch: false,
                fill_offset: 0.0,
            }),
        }
    }

    /// Convenience constructor that derives base/quote from the symbol name
    pub fn for_symbol(symbol: &str, price: f64, quote_balance: f64) -> Self {
        let (base, quote) = split_symbol(symbol);
        Self::new(
            Market {
                symbol: symbol.to_string(),
                base,
                quote,
                amount_precision: 6,
                price_precision: 2,
                min_amount: 0.000001,
            },
            price,
            quote_balance,
        )
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, free: f64) {
        self.state.lock().unwrap().balances.insert(
            asset.to_string(),
            AssetBalance { free, locked: 0.0 },
        );
    }

    pub fn balance_of(&self, asset: &str) -> f64 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(asset)
            .map(|b| b.free)
            .unwrap_or(0.0)
    }

    pub fn set_min_amount(&self, symbol: &str, min_amount: f64) {
        if let Some(market) = self.state.lock().unwrap().markets.get_mut(symbol) {
            market.min_amount = min_amount;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_reject_orders(&self, reject: bool) {
        self.state.lock().unwrap().reject_orders = reject;
    }

    pub fn set_reject_stop_orders(&self, reject: bool) {
        self.state.lock().unwrap().reject_stop_orders = reject;
    }

    /// Market orders come back unfilled; `fill_on_fetch` controls whether a
    /// later `fetch_order` reports them filled
    pub fn set_defer_fills(&self, defer: bool, fill_on_fetch: bool) {
        let mut state = self.state.lock().unwrap();
        state.defer_fills = defer;
        state.fill_deferred_on_fetch = fill_on_fetch;
    }

    pub fn set_fill_offset(&self, offset: f64) {
        self.state.lock().unwrap().fill_offset = offset;
    }

    /// Count of resting (open) orders for a symbol
    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_open())
            .count()
    }
}

fn split_symbol(symbol: &str) -> (String, String) {
    for quote in KNOWN_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    // Fallback: last three characters as the quote asset
    let split = symbol.len().saturating_sub(3);
    (symbol[..split].to_string(), symbol[split..].to_string())
}

impl PaperState {
    fn ensure_online(&self) -> Result<(), ExchangeError> {
        if self.offline {
            Err(ExchangeError::Network("paper exchange offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_order_id(&mut self) -> String {
        let id = format!("P-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn price_of(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.to_string()))
    }

    fn fill_price(&self, symbol: &str, side: OrderSide) -> Result<f64, ExchangeError> {
        let last = self.price_of(symbol)?;
        Ok(match side {
            OrderSide::Buy => last * (1.0 + self.fill_offset),
            OrderSide::Sell => last * (1.0 - self.fill_offset),
        })
    }

    fn settle_fill(&mut self, symbol: &str, side: OrderSide, amount: f64, fill_price: f64) {
        let market = match self.markets.get(symbol) {
            Some(m) => m.clone(),
            None => return,
        };
        let notional = amount * fill_price;
        let base = self.balances.entry(market.base).or_default();
        match side {
            OrderSide::Buy => base.free += amount,
            OrderSide::Sell => base.free -= amount,
        }
        let quote = self.balances.entry(market.quote).or_default();
        match side {
            OrderSide::Buy => quote.free -= notional,
            OrderSide::Sell => quote.free += notional,
        }
    }

    fn create_market_order(
        &mut self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
    ) -> Result<Order, ExchangeError> {
        self.ensure_online()?;
        if self.reject_orders {
            return Err(ExchangeError::Api {
                code: -1013,
                message: "order rejected".to_string(),
            });
        }

        let fill_price = self.fill_price(symbol, side)?;
        let id = self.next_order_id();

        let mut order = Order {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            status: OrderStatus::New,
            amount,
            filled: 0.0,
            average: None,
            price: None,
            stop_price: None,
            timestamp: Utc::now(),
        };

        if !self.defer_fills {
            order.status = OrderStatus::Filled;
            order.filled = amount;
            order.average = Some(fill_price);
            self.settle_fill(symbol, side, amount, fill_price);
        }

        self.orders.insert(id, order.clone());
        Ok(order)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn load_markets(&self) -> Result<(), ExchangeError> {
        self.state.lock().unwrap().ensure_online()
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.state.lock().unwrap().markets.get(symbol).cloned()
    }

    async fn fetch_balance(&self) -> Result<Balances, ExchangeError> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        Ok(state.balances.clone())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: state.price_of(symbol)?,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        Ok(state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_open())
            .cloned()
            .collect())
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_online()?;

        // Deferred market orders fill on re-fetch when scripted to
        let should_fill = {
            let order = state
                .orders
                .get(id)
                .ok_or_else(|| ExchangeError::OrderNotFound(id.to_string()))?;
            state.fill_deferred_on_fetch
                && order.order_type == OrderType::Market
                && order.status == OrderStatus::New
        };

        if should_fill {
            let (side, amount) = {
                let order = state.orders.get(id).unwrap();
                (order.side, order.amount)
            };
            let fill_price = state.fill_price(symbol, side)?;
            state.settle_fill(symbol, side, amount, fill_price);
            let order = state.orders.get_mut(id).unwrap();
            order.status = OrderStatus::Filled;
            order.filled = amount;
            order.average = Some(fill_price);
        }

        Ok(state.orders.get(id).unwrap().clone())
    }

    async fn create_market_buy_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .create_market_order(symbol, OrderSide::Buy, amount)
    }

    async fn create_market_sell_order(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<Order, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .create_market_order(symbol, OrderSide::Sell, amount)
    }

    async fn create_stop_loss_limit_order(
        &self,
        symbol: &str,
        amount: f64,
        limit_price: f64,
        stop_price: f64,
    ) -> Result<Order, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_online()?;
        if state.reject_stop_orders {
            return Err(ExchangeError::Api {
                code: -1013,
                message: "stop order rejected".to_string(),
            });
        }

        let id = state.next_order_id();
        let order = Order {
            id: id.clone(),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::StopLossLimit,
            status: OrderStatus::New,
            amount,
            filled: 0.0,
            average: None,
            price: Some(limit_price),
            stop_price: Some(stop_price),
            timestamp: Utc::now(),
        };
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_online()?;
        let _ = symbol;

        match state.orders.get_mut(id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(ExchangeError::OrderNotFound(id.to_string())),
            None => Err(ExchangeError::OrderNotFound(id.to_string())),
        }
    }

    async fn fetch_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.state.lock().unwrap().ensure_online()?;
        Ok(Utc::now())
    }
}
