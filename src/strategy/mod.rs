// Signal-source capability surface
pub mod threshold;

use crate::models::{Candle, Signal};

pub use threshold::ThresholdStrategy;

/// Capability surface the engine depends on.
///
/// Strategy variants are pure signal sources; everything order- and
/// risk-related stays in the engine.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Map price history to a signal for this tick
    fn analyze(&mut self, candles: &[Candle], current_price: f64) -> Signal;

    /// Cooldown bookkeeping, called after an executed entry
    fn record_trade(&mut self) {}

    /// Re-synchronize internal position tracking after startup
    /// reconciliation adopts a holding with an unknown entry
    fn restore_position_state(&mut self, _entry_price: f64, _current_price: f64) {}

    /// Drop all internal state
    fn reset(&mut self) {}
}

/// Look up a strategy variant by name
pub fn create(name: &str) -> Option<Box<dyn Strategy>> {
    match name {
        "threshold" => Some(Box::new(ThresholdStrategy::default())),
        _ => None,
    }
}

/// Names accepted by [`create`]
pub fn variants() -> &'static [&'static str] {
    &["threshold"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_its_variants() {
        for name in variants() {
            assert!(create(name).is_some(), "registry missing {name}");
        }
        assert!(create("does-not-exist").is_none());
    }
}
