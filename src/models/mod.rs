use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV candlestick, aggregated from ticker polls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build a flat candle from a single price sample
    pub fn from_price(price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }
}

/// What the strategy wants to do this tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    Close,
}

/// Strategy output for one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: String,
}

impl Signal {
    pub fn hold(price: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            price,
            stop_loss: None,
            take_profit: None,
            reason: reason.into(),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EmergencyStop,
    Reconcile,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::Signal => "strategy signal",
            ExitReason::EmergencyStop => "emergency stop",
            ExitReason::Reconcile => "startup reconciliation",
        };
        f.write_str(s)
    }
}

/// The single open position of an engine instance (spot, long only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub amount: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Exchange-side stop order bound to this position, if one was accepted
    pub stop_order_id: Option<String>,
    /// Exchange rejected the stop order; exits are monitored in software only
    pub software_stop: bool,
    pub entry_time: DateTime<Utc>,
    pub expected_price: f64,
    pub actual_fill_price: f64,
    pub slippage: f64,
}

impl Position {
    /// Update mark price and unrealized P&L
    pub fn mark_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.amount;
    }
}

/// Immutable record of one completed round trip, net of fees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub profit: f64,
    pub win: bool,
    pub entry_price: f64,
    pub exit_price: f64,
    pub expected_exit_price: f64,
    pub slippage: f64,
    pub amount: f64,
    pub reason: ExitReason,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            amount: 2.0,
            entry_price: 100.0,
            current_price: 100.0,
            unrealized_pnl: 0.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            stop_order_id: None,
            software_stop: false,
            entry_time: Utc::now(),
            expected_price: 100.0,
            actual_fill_price: 100.0,
            slippage: 0.0,
        }
    }

    #[test]
    fn test_mark_price_updates_unrealized_pnl() {
        let mut position = make_position();

        position.mark_price(104.0);
        assert_eq!(position.current_price, 104.0);
        assert_eq!(position.unrealized_pnl, 8.0);

        position.mark_price(97.0);
        assert_eq!(position.unrealized_pnl, -6.0);
    }

    #[test]
    fn test_flat_candle_from_price() {
        let candle = Candle::from_price(42.5, Utc::now());
        assert_eq!(candle.open, 42.5);
        assert_eq!(candle.high, 42.5);
        assert_eq!(candle.low, 42.5);
        assert_eq!(candle.close, 42.5);
        assert_eq!(candle.volume, 0.0);
    }
}
