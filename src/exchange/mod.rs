// Exchange connectivity module
pub mod binance;
pub mod client;
pub mod paper;

pub use binance::BinanceClient;
pub use client::{
    AssetBalance, Balances, ExchangeClient, ExchangeError, Market, Order, OrderSide, OrderStatus,
    OrderType, Ticker,
};
pub use paper::PaperExchange;
