use super::Strategy;
use crate::models::{Candle, Signal, SignalAction};

/// Mean-reversion threshold strategy
///
/// Buys when price dips a configured fraction below its moving average and
/// sells when it stretches the same way above. Deliberately simple: it is
/// the reference implementation of the strategy capability, not a serious
/// trading signal.
#[derive(Debug, Clone)]
pub struct ThresholdStrategy {
    lookback: usize,
    entry_drop_pct: f64,
    exit_rise_pct: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    cooldown_ticks: u32,
    cooldown_remaining: u32,
    restored_entry: Option<f64>,
}

impl ThresholdStrategy {
    pub fn new(lookback: usize, entry_drop_pct: f64, exit_rise_pct: f64) -> Self {
        Self {
            lookback,
            entry_drop_pct,
            exit_rise_pct,
            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
            cooldown_ticks: 3,
            cooldown_remaining: 0,
            restored_entry: None,
        }
    }

    fn sma(&self, candles: &[Candle]) -> f64 {
        let window = &candles[candles.len() - self.lookback..];
        window.iter().map(|c| c.close).sum::<f64>() / self.lookback as f64
    }
}

impl Default for ThresholdStrategy {
    fn default() -> Self {
        Self::new(12, 0.02, 0.02)
    }
}

impl Strategy for ThresholdStrategy {
    fn name(&self) -> &str {
        "ThresholdStrategy"
    }

    fn analyze(&mut self, candles: &[Candle], current_price: f64) -> Signal {
        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            return Signal::hold(current_price, "cooling down after trade");
        }

        // An adopted position has no history behind it; exit on the
        // configured rise from its restored entry instead of the average
        if let Some(entry) = self.restored_entry {
            if current_price >= entry * (1.0 + self.exit_rise_pct) {
                self.restored_entry = None;
                return Signal {
                    action: SignalAction::Sell,
                    price: current_price,
                    stop_loss: None,
                    take_profit: None,
                    reason: format!(
                        "price {:.2} is {:.1}% above restored entry {:.2}",
                        current_price,
                        (current_price / entry - 1.0) * 100.0,
                        entry
                    ),
                };
            }
        }

        if candles.len() < self.lookback {
            return Signal::hold(
                current_price,
                format!("warming up ({}/{} candles)", candles.len(), self.lookback),
            );
        }

        let sma = self.sma(candles);

        if current_price <= sma * (1.0 - self.entry_drop_pct) {
            return Signal {
                action: SignalAction::Buy,
                price: current_price,
                stop_loss: Some(current_price * (1.0 - self.stop_loss_pct)),
                take_profit: Some(current_price * (1.0 + self.take_profit_pct)),
                reason: format!(
                    "price {:.2} is {:.1}% below sma {:.2}",
                    current_price,
                    (1.0 - current_price / sma) * 100.0,
                    sma
                ),
            };
        }

        if current_price >= sma * (1.0 + self.exit_rise_pct) {
            return Signal {
                action: SignalAction::Sell,
                price: current_price,
                stop_loss: None,
                take_profit: None,
                reason: format!(
                    "price {:.2} is {:.1}% above sma {:.2}",
                    current_price,
                    (current_price / sma - 1.0) * 100.0,
                    sma
                ),
            };
        }

        Signal::hold(current_price, "price within band")
    }

    fn record_trade(&mut self) {
        self.cooldown_remaining = self.cooldown_ticks;
    }

    fn restore_position_state(&mut self, entry_price: f64, _current_price: f64) {
        self.restored_entry = Some(entry_price);
    }

    fn reset(&mut self) {
        self.cooldown_remaining = 0;
        self.restored_entry = None;
    }
}
