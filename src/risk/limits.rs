use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::state::{BudgetState, RiskState};

/// Configurable thresholds for the layered capital-protection checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Absolute deviation of account value from the initial tracked balance
    /// that latches the emergency stop
    pub max_drawdown_pct: f64,
    /// Realized loss since the daily baseline that latches the daily halt
    pub max_daily_loss_pct: f64,
    /// Trailing-hour realized loss (relative to the daily baseline) that
    /// pauses new entries
    pub max_hourly_loss_pct: f64,
    pub max_trades_per_day: u32,
    /// Losing streak length that refuses new entries outright
    pub max_consecutive_losses: u32,
    /// Losing streak length that halves position sizing
    pub half_size_after_losses: u32,
    pub half_size_multiplier: f64,
    /// Hard cap on position notional as a fraction of the current budget
    pub max_position_pct: f64,
    /// Target position notional as a fraction of the current budget
    pub order_pct: f64,
    /// Fill slippage above this fraction is logged as a warning
    pub slippage_warn_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 0.15,      // -15% total halts the engine
            max_daily_loss_pct: 0.05,    // -5% daily
            max_hourly_loss_pct: 0.02,   // -2% in the trailing hour
            max_trades_per_day: 10,      // Max 10 entries per day
            max_consecutive_losses: 3,   // 3 losses in a row refuses entries
            half_size_after_losses: 2,   // 2 losses in a row halves sizing
            half_size_multiplier: 0.5,
            max_position_pct: 0.15,      // 15% of budget, hard cap
            order_pct: 0.12,             // 12% of budget per entry
            slippage_warn_pct: 0.001,    // warn above 0.1%
        }
    }
}

/// Why the gate refused to act.
///
/// These are deliberate business decisions, not errors; the tick resolves
/// as "no action" and the engine keeps running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RiskHalt {
    /// Latched on a prior tick; everything is rejected until restart
    EmergencyStop,
    /// Account value deviated too far this tick; latches the emergency stop
    Drawdown,
    DailyLoss,
    HourlyLossRate,
    TradeLimit,
    ConsecutiveLosses,
}

impl std::fmt::Display for RiskHalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskHalt::EmergencyStop => "emergency stop latched",
            RiskHalt::Drawdown => "drawdown limit breached",
            RiskHalt::DailyLoss => "daily loss limit",
            RiskHalt::HourlyLossRate => "hourly loss rate",
            RiskHalt::TradeLimit => "trades-per-day limit",
            RiskHalt::ConsecutiveLosses => "consecutive loss protection",
        };
        f.write_str(s)
    }
}

/// Per-tick inputs to the gate
#[derive(Debug, Clone, Copy)]
pub struct GateContext {
    pub now: DateTime<Utc>,
    /// Tracked real balance plus mark-to-market value of any open position
    pub total_account_value: f64,
    /// True when the signal would open a new position
    pub opening_new_position: bool,
}

impl RiskLimits {
    /// Evaluate the protection checks in their fixed order, short-circuiting
    /// on the first failure.
    ///
    /// Latch updates (daily rollover, daily-loss latch, trade-count latch,
    /// sizing reduction) are applied to `state` as a side effect even when
    /// the check itself does not block the current action. Checks for the
    /// trade cap and loss streak only apply when opening a new position;
    /// the emergency stop rejects everything.
    ///
    /// A `Drawdown` result means the latch was set on THIS call and the
    /// caller must force-close any open position.
    pub fn evaluate(
        &self,
        state: &mut RiskState,
        budget: &BudgetState,
        ctx: &GateContext,
    ) -> Result<(), RiskHalt> {
        if state.emergency_stop_triggered {
            return Err(RiskHalt::EmergencyStop);
        }

        // Drawdown: absolute deviation from the initial tracked balance
        if budget.initial_real_balance > 0.0 {
            let deviation = (ctx.total_account_value - budget.initial_real_balance).abs()
                / budget.initial_real_balance;
            if deviation >= self.max_drawdown_pct {
                state.emergency_stop_triggered = true;
                return Err(RiskHalt::Drawdown);
            }
        }

        // Daily window: roll over after 24h, otherwise latch on deep loss
        if ctx.now - state.daily_start_time >= Duration::hours(24) {
            state.roll_daily_window(budget.current_real_balance, ctx.now);
        } else if state.daily_start_balance > 0.0 {
            let daily_loss = (state.daily_start_balance - budget.current_real_balance)
                / state.daily_start_balance;
            if daily_loss >= self.max_daily_loss_pct {
                state.daily_loss_triggered = true;
            }
        }
        if state.daily_loss_triggered && ctx.opening_new_position {
            return Err(RiskHalt::DailyLoss);
        }

        // Hourly loss rate: no latch, recovers as samples age out
        state.prune_hourly(ctx.now);
        let hour_pnl: f64 = state.hourly_pnl_history.iter().map(|s| s.pnl).sum();
        if ctx.opening_new_position
            && hour_pnl < 0.0
            && state.daily_start_balance > 0.0
            && hour_pnl.abs() / state.daily_start_balance >= self.max_hourly_loss_pct
        {
            return Err(RiskHalt::HourlyLossRate);
        }

        if ctx.opening_new_position {
            if state.trades_per_day_triggered || state.daily_trade_count >= self.max_trades_per_day
            {
                state.trades_per_day_triggered = true;
                return Err(RiskHalt::TradeLimit);
            }

            if state.consecutive_losses >= self.max_consecutive_losses {
                return Err(RiskHalt::ConsecutiveLosses);
            }
            if state.consecutive_losses >= self.half_size_after_losses {
                state.position_size_multiplier = self.half_size_multiplier;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::state::PnlSample;

    fn entry_ctx(now: DateTime<Utc>, total: f64) -> GateContext {
        GateContext {
            now,
            total_account_value: total,
            opening_new_position: true,
        }
    }

    fn manage_ctx(now: DateTime<Utc>, total: f64) -> GateContext {
        GateContext {
            now,
            total_account_value: total,
            opening_new_position: false,
        }
    }

    #[test]
    fn test_gate_passes_with_clean_state() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, now);

        assert!(limits
            .evaluate(&mut state, &budget, &entry_ctx(now, 500.0))
            .is_ok());
    }

    #[test]
    fn test_drawdown_latches_emergency_stop() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut budget = BudgetState::new(500.0);
        budget.current_real_balance = 424.0; // 15.2% below initial
        let mut state = RiskState::new(500.0, now);

        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 424.0));
        assert_eq!(result, Err(RiskHalt::Drawdown));
        assert!(state.emergency_stop_triggered);

        // Every later evaluation rejects at the top, even after recovery
        budget.current_real_balance = 500.0;
        let result = limits.evaluate(&mut state, &budget, &manage_ctx(now, 500.0));
        assert_eq!(result, Err(RiskHalt::EmergencyStop));
    }

    #[test]
    fn test_drawdown_uses_absolute_deviation() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, now);

        // 15% above the baseline trips the check as well
        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 576.0));
        assert_eq!(result, Err(RiskHalt::Drawdown));
    }

    #[test]
    fn test_drawdown_includes_unrealized_pnl() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, now);

        // Real balance intact but the open position is deep under water
        let total = 500.0 - 80.0;
        let result = limits.evaluate(&mut state, &budget, &manage_ctx(now, total));
        assert_eq!(result, Err(RiskHalt::Drawdown));
    }

    #[test]
    fn test_daily_loss_latches_until_rollover() {
        let limits = RiskLimits::default();
        let start = Utc::now();
        let mut budget = BudgetState::new(500.0);
        budget.current_real_balance = 474.0; // -5.2% on the day
        let mut state = RiskState::new(500.0, start);

        let result = limits.evaluate(&mut state, &budget, &entry_ctx(start, 474.0));
        assert_eq!(result, Err(RiskHalt::DailyLoss));
        assert!(state.daily_loss_triggered);

        // Still latched while the window is open, even if balance recovers
        budget.current_real_balance = 495.0;
        let later = start + Duration::hours(12);
        let result = limits.evaluate(&mut state, &budget, &entry_ctx(later, 495.0));
        assert_eq!(result, Err(RiskHalt::DailyLoss));

        // Managing an open position is still allowed
        let result = limits.evaluate(&mut state, &budget, &manage_ctx(later, 495.0));
        assert!(result.is_ok());
    }

    #[test]
    fn test_daily_rollover_boundary_is_exact() {
        let limits = RiskLimits::default();
        let start = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, start);
        state.daily_trade_count = 9;

        // 1ms before the 24h boundary: no reset
        let just_before = start + Duration::hours(24) - Duration::milliseconds(1);
        limits
            .evaluate(&mut state, &budget, &entry_ctx(just_before, 500.0))
            .unwrap();
        assert_eq!(state.daily_trade_count, 9);
        assert_eq!(state.daily_start_time, start);

        // 1ms after: the window rolls over
        let just_after = start + Duration::hours(24) + Duration::milliseconds(1);
        limits
            .evaluate(&mut state, &budget, &entry_ctx(just_after, 500.0))
            .unwrap();
        assert_eq!(state.daily_trade_count, 0);
        assert_eq!(state.daily_start_time, just_after);
    }

    #[test]
    fn test_hourly_loss_rate_blocks_entries_without_latch() {
        let limits = RiskLimits::default();
        let start = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, start);

        // -11 over the trailing hour is -2.2% of the daily baseline
        state.hourly_pnl_history.push(PnlSample {
            timestamp: start,
            pnl: -11.0,
        });

        let result = limits.evaluate(&mut state, &budget, &entry_ctx(start, 500.0));
        assert_eq!(result, Err(RiskHalt::HourlyLossRate));

        // Recovers naturally once the sample ages out of the window
        let later = start + Duration::minutes(61);
        let result = limits.evaluate(&mut state, &budget, &entry_ctx(later, 500.0));
        assert!(result.is_ok());
    }

    #[test]
    fn test_trade_limit_latches_for_entries() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, now);
        state.daily_trade_count = 10;

        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 500.0));
        assert_eq!(result, Err(RiskHalt::TradeLimit));
        assert!(state.trades_per_day_triggered);

        // Not consulted when managing an existing position
        let result = limits.evaluate(&mut state, &budget, &manage_ctx(now, 500.0));
        assert!(result.is_ok());
    }

    #[test]
    fn test_consecutive_losses_refuse_then_halve() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let budget = BudgetState::new(500.0);
        let mut state = RiskState::new(500.0, now);

        state.consecutive_losses = 3;
        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 500.0));
        assert_eq!(result, Err(RiskHalt::ConsecutiveLosses));

        state.consecutive_losses = 2;
        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 500.0));
        assert!(result.is_ok());
        assert_eq!(state.position_size_multiplier, 0.5);
    }

    #[test]
    fn test_check_order_drawdown_before_daily() {
        // A state that violates both the drawdown and daily checks must
        // report the drawdown first
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut budget = BudgetState::new(500.0);
        budget.current_real_balance = 400.0;
        let mut state = RiskState::new(500.0, now);

        let result = limits.evaluate(&mut state, &budget, &entry_ctx(now, 400.0));
        assert_eq!(result, Err(RiskHalt::Drawdown));
        assert!(!state.daily_loss_triggered);
    }
}
