// Order execution module
pub mod candle_buffer;
pub mod engine;
pub mod ledger;
mod reconcile;

pub use candle_buffer::CandleBuffer;
pub use engine::{ConnectionHealth, EngineConfig, LiveEngine, TickOutcome};
pub use ledger::PositionLedger;
