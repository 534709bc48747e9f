// Core modules
pub mod clock;
pub mod config;
pub mod exchange;
pub mod execution;
pub mod models;
pub mod risk;
pub mod stats;
pub mod strategy;

// Re-export commonly used types
pub use exchange::{BinanceClient, ExchangeClient, ExchangeError, PaperExchange};
pub use execution::{EngineConfig, LiveEngine, TickOutcome};
pub use models::*;
pub use stats::EngineReport;
pub use strategy::Strategy;
