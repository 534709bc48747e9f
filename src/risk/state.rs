use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::limits::RiskLimits;

/// Allocated vs tracked capital for one engine instance.
///
/// `current_budget` is the sizing pool: it moves only by executed trade
/// notional and fees. `current_real_balance` is the P&L baseline: it moves
/// only by realized net profit, never by unrealized P&L.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub initial_budget: f64,
    pub current_budget: f64,
    pub initial_real_balance: f64,
    pub current_real_balance: f64,
}

impl BudgetState {
    pub fn new(initial_budget: f64) -> Self {
        Self {
            initial_budget,
            current_budget: initial_budget,
            initial_real_balance: initial_budget,
            current_real_balance: initial_budget,
        }
    }
}

/// One realized P&L sample in the trailing-hour window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PnlSample {
    pub timestamp: DateTime<Utc>,
    pub pnl: f64,
}

/// Mutable risk counters and latches for one engine instance.
///
/// `emergency_stop_triggered` is monotonic: once set it survives until the
/// process restarts. The daily fields reset together when the rolling 24h
/// window rolls over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub emergency_stop_triggered: bool,
    pub consecutive_losses: u32,
    pub position_size_multiplier: f64,
    pub daily_start_balance: f64,
    pub daily_start_time: DateTime<Utc>,
    pub daily_trade_count: u32,
    pub daily_loss_triggered: bool,
    pub trades_per_day_triggered: bool,
    pub hourly_pnl_history: Vec<PnlSample>,
}

impl RiskState {
    pub fn new(initial_balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            emergency_stop_triggered: false,
            consecutive_losses: 0,
            position_size_multiplier: 1.0,
            daily_start_balance: initial_balance,
            daily_start_time: now,
            daily_trade_count: 0,
            daily_loss_triggered: false,
            trades_per_day_triggered: false,
            hourly_pnl_history: Vec::new(),
        }
    }

    /// Reset every daily counter against a fresh balance baseline
    pub fn roll_daily_window(&mut self, balance: f64, now: DateTime<Utc>) {
        self.daily_start_balance = balance;
        self.daily_start_time = now;
        self.daily_trade_count = 0;
        self.daily_loss_triggered = false;
        self.trades_per_day_triggered = false;
    }

    /// Drop P&L samples older than the trailing hour
    pub fn prune_hourly(&mut self, now: DateTime<Utc>) {
        self.hourly_pnl_history
            .retain(|s| now - s.timestamp < Duration::minutes(60));
    }

    /// Net realized P&L over the trailing hour (read-only, no pruning)
    pub fn trailing_hour_pnl(&self, now: DateTime<Utc>) -> f64 {
        self.hourly_pnl_history
            .iter()
            .filter(|s| now - s.timestamp < Duration::minutes(60))
            .map(|s| s.pnl)
            .sum()
    }

    /// Fold a realized trade result into the streak and hourly window.
    ///
    /// Any non-losing trade resets the streak and restores full sizing;
    /// a loss increments the streak and halves sizing once the streak
    /// reaches the configured threshold.
    pub fn record_trade_result(&mut self, net_profit: f64, now: DateTime<Utc>, limits: &RiskLimits) {
        self.hourly_pnl_history.push(PnlSample {
            timestamp: now,
            pnl: net_profit,
        });
        self.prune_hourly(now);

        if net_profit < 0.0 {
            self.consecutive_losses += 1;
            if self.consecutive_losses >= limits.half_size_after_losses {
                self.position_size_multiplier = limits.half_size_multiplier;
            }
        } else {
            self.consecutive_losses = 0;
            self.position_size_multiplier = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_resets_streak_and_multiplier() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut state = RiskState::new(500.0, now);

        state.record_trade_result(-5.0, now, &limits);
        state.record_trade_result(-5.0, now, &limits);
        assert_eq!(state.consecutive_losses, 2);
        assert_eq!(state.position_size_multiplier, 0.5);

        // A win fully restores sizing regardless of streak length
        state.record_trade_result(1.0, now, &limits);
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.position_size_multiplier, 1.0);
    }

    #[test]
    fn test_breakeven_counts_as_win_for_streak() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut state = RiskState::new(500.0, now);

        state.record_trade_result(-5.0, now, &limits);
        state.record_trade_result(0.0, now, &limits);
        assert_eq!(state.consecutive_losses, 0);
    }

    #[test]
    fn test_hourly_window_prunes_old_samples() {
        let limits = RiskLimits::default();
        let start = Utc::now();
        let mut state = RiskState::new(500.0, start);

        state.record_trade_result(-10.0, start, &limits);
        state.record_trade_result(-2.0, start + Duration::minutes(30), &limits);

        let now = start + Duration::minutes(61);
        assert_eq!(state.trailing_hour_pnl(now), -2.0);

        state.prune_hourly(now);
        assert_eq!(state.hourly_pnl_history.len(), 1);
    }

    #[test]
    fn test_roll_daily_window_resets_everything_daily() {
        let now = Utc::now();
        let mut state = RiskState::new(500.0, now);
        state.daily_trade_count = 7;
        state.daily_loss_triggered = true;
        state.trades_per_day_triggered = true;

        let later = now + Duration::hours(25);
        state.roll_daily_window(480.0, later);

        assert_eq!(state.daily_start_balance, 480.0);
        assert_eq!(state.daily_start_time, later);
        assert_eq!(state.daily_trade_count, 0);
        assert!(!state.daily_loss_triggered);
        assert!(!state.trades_per_day_triggered);
    }
}
