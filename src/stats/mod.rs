// Performance reporting module
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execution::PositionLedger;
use crate::models::Position;
use crate::risk::RiskState;

/// Window of recent fills used for the average-slippage figure
const SLIPPAGE_WINDOW: usize = 100;

/// Read-only snapshot of one engine instance for external monitoring.
///
/// Pure derivation over the ledger and risk state; querying it never
/// mutates anything.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub bot_name: String,
    pub strategy_name: String,
    pub symbol: String,
    pub running: bool,

    pub initial_budget: f64,
    pub current_budget: f64,
    pub initial_real_balance: f64,
    pub current_real_balance: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage of winning trades, 0 when no trades yet
    pub win_rate: f64,
    pub total_pnl: f64,

    /// Loss of account value relative to the initial tracked balance, as a
    /// percentage; negative when in profit
    pub current_drawdown_pct: f64,
    /// Average fill slippage over the most recent trades
    pub average_slippage: f64,
    pub daily_loss_pct: f64,
    pub trailing_hour_pnl: f64,

    pub open_position: Option<Position>,

    pub emergency_stop_triggered: bool,
    pub daily_loss_triggered: bool,
    pub trades_per_day_triggered: bool,
    pub daily_trade_count: u32,
    pub consecutive_losses: u32,
    pub position_size_multiplier: f64,
    pub connection_healthy: bool,
    pub multi_bot_mode: bool,
}

impl EngineReport {
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        bot_name: &str,
        strategy_name: &str,
        symbol: &str,
        running: bool,
        ledger: &PositionLedger,
        risk: &RiskState,
        connection_healthy: bool,
        multi_bot_mode: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let trades = ledger.trades();
        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.win).count();
        let losing_trades = total_trades - winning_trades;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let recent = trades.iter().rev().take(SLIPPAGE_WINDOW);
        let recent_count = total_trades.min(SLIPPAGE_WINDOW);
        let average_slippage = if recent_count > 0 {
            recent.map(|t| t.slippage).sum::<f64>() / recent_count as f64
        } else {
            0.0
        };

        let budget = ledger.budget();
        let current_drawdown_pct = if budget.initial_real_balance > 0.0 {
            (budget.initial_real_balance - ledger.total_account_value())
                / budget.initial_real_balance
                * 100.0
        } else {
            0.0
        };

        let daily_loss_pct = if risk.daily_start_balance > 0.0 {
            (risk.daily_start_balance - budget.current_real_balance) / risk.daily_start_balance
                * 100.0
        } else {
            0.0
        };

        Self {
            bot_name: bot_name.to_string(),
            strategy_name: strategy_name.to_string(),
            symbol: symbol.to_string(),
            running,
            initial_budget: budget.initial_budget,
            current_budget: budget.current_budget,
            initial_real_balance: budget.initial_real_balance,
            current_real_balance: budget.current_real_balance,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            total_pnl: ledger.total_pnl(),
            current_drawdown_pct,
            average_slippage,
            daily_loss_pct,
            trailing_hour_pnl: risk.trailing_hour_pnl(now),
            open_position: ledger.position().cloned(),
            emergency_stop_triggered: risk.emergency_stop_triggered,
            daily_loss_triggered: risk.daily_loss_triggered,
            trades_per_day_triggered: risk.trades_per_day_triggered,
            daily_trade_count: risk.daily_trade_count,
            consecutive_losses: risk.consecutive_losses,
            position_size_multiplier: risk.position_size_multiplier,
            connection_healthy,
            multi_bot_mode,
        }
    }
}
