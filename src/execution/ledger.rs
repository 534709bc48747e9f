use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ExitReason, Position, TradeRecord};
use crate::risk::BudgetState;

/// The position/budget ledger for one engine instance.
///
/// Holds the at-most-one open position, the budget figures, and the
/// append-only trade history. All budget mutations happen here so the
/// invariants have a single owner: `current_budget` moves only by executed
/// notional and fees, `current_real_balance` only by realized net profit.
pub struct PositionLedger {
    position: Option<Position>,
    budget: BudgetState,
    trades: Vec<TradeRecord>,
    /// Per-side fee rate, e.g. 0.00075 for 0.075%
    fee_rate: f64,
}

impl PositionLedger {
    pub fn new(initial_budget: f64, fee_rate: f64) -> Self {
        Self {
            position: None,
            budget: BudgetState::new(initial_budget),
            trades: Vec::new(),
            fee_rate,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        self.position.as_mut()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn budget(&self) -> &BudgetState {
        &self.budget
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    /// Mutable budget access (for testing)
    #[cfg(test)]
    pub fn budget_mut(&mut self) -> &mut BudgetState {
        &mut self.budget
    }

    /// Total realized P&L across the trade history
    pub fn total_pnl(&self) -> f64 {
        self.trades.iter().map(|t| t.profit).sum()
    }

    /// Tracked real balance plus mark-to-market value of the open position
    pub fn total_account_value(&self) -> f64 {
        let unrealized = self
            .position
            .as_ref()
            .map(|p| p.unrealized_pnl)
            .unwrap_or(0.0);
        self.budget.current_real_balance + unrealized
    }

    /// Update the open position's mark price, if any
    pub fn mark_price(&mut self, price: f64) {
        if let Some(position) = self.position.as_mut() {
            position.mark_price(price);
        }
    }

    /// Record a freshly filled entry: deducts notional plus the entry fee
    /// from the budget and installs the position
    pub fn open(&mut self, position: Position) -> anyhow::Result<()> {
        if self.position.is_some() {
            anyhow::bail!("a position is already open");
        }

        let notional = position.amount * position.entry_price;
        let entry_fee = notional * self.fee_rate;
        self.budget.current_budget -= notional + entry_fee;
        self.position = Some(position);
        Ok(())
    }

    /// Install a position without touching the budget.
    ///
    /// Used by startup reconciliation when adopting a holding whose capital
    /// was committed by a previous session.
    pub fn adopt(&mut self, position: Position) -> anyhow::Result<()> {
        if self.position.is_some() {
            anyhow::bail!("a position is already open");
        }
        self.position = Some(position);
        Ok(())
    }

    /// Settle the open position against an exit fill.
    ///
    /// Gross profit is marked against the actual fill; fees are charged on
    /// both entry and exit notional. Returns the appended trade record.
    pub fn close(
        &mut self,
        actual_fill_price: f64,
        expected_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TradeRecord> {
        let position = self
            .position
            .take()
            .ok_or_else(|| anyhow::anyhow!("no open position to close"))?;

        let entry_notional = position.amount * position.entry_price;
        let exit_notional = position.amount * actual_fill_price;
        let gross = position.amount * (actual_fill_price - position.entry_price);
        let fees = (entry_notional + exit_notional) * self.fee_rate;
        let net = gross - fees;

        let exit_fee = exit_notional * self.fee_rate;
        self.budget.current_budget += exit_notional - exit_fee;
        self.budget.current_real_balance += net;

        let slippage = if expected_price > 0.0 {
            (actual_fill_price - expected_price).abs() / expected_price
        } else {
            0.0
        };

        let record = TradeRecord {
            id: Uuid::new_v4(),
            symbol: position.symbol,
            profit: net,
            win: net >= 0.0,
            entry_price: position.entry_price,
            exit_price: actual_fill_price,
            expected_exit_price: expected_price,
            slippage,
            amount: position.amount,
            reason,
            timestamp: now,
        };
        self.trades.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEE_RATE: f64 = 0.00075;

    fn entry_position(entry_price: f64, amount: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            amount,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
            stop_order_id: None,
            software_stop: false,
            entry_time: Utc::now(),
            expected_price: entry_price,
            actual_fill_price: entry_price,
            slippage: 0.0,
        }
    }

    #[test]
    fn test_open_deducts_notional_and_fee_exactly() {
        // $60 notional on a $500 budget: fee $0.045, budget $439.955
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 0.6)).unwrap();

        assert!(ledger.has_position());
        assert!((ledger.budget().current_budget - 439.955).abs() < 1e-9);
        assert_eq!(ledger.budget().current_real_balance, 500.0);
    }

    #[test]
    fn test_second_open_is_rejected() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 0.5)).unwrap();

        let result = ledger.open(entry_position(101.0, 0.5));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("already open"));
    }

    #[test]
    fn test_close_fee_math_on_winning_trade() {
        // Entry $100 x 1, exit fill $102: gross $2, fees $0.1515, net $1.8485
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 1.0)).unwrap();

        let record = ledger
            .close(102.0, 102.0, ExitReason::Signal, Utc::now())
            .unwrap();

        assert!((record.profit - 1.8485).abs() < 1e-9);
        assert!(record.win);
        assert!(!ledger.has_position());
        assert!((ledger.budget().current_real_balance - 501.8485).abs() < 1e-9);

        // Budget: 500 - 100 - 0.075 + 102 - 0.0765
        assert!((ledger.budget().current_budget - 501.8485).abs() < 1e-9);
    }

    #[test]
    fn test_close_records_loss() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 1.0)).unwrap();

        let record = ledger
            .close(97.0, 97.0, ExitReason::StopLoss, Utc::now())
            .unwrap();

        assert!(record.profit < 0.0);
        assert!(!record.win);
        assert_eq!(record.reason, ExitReason::StopLoss);
        assert!(ledger.budget().current_real_balance < 500.0);
    }

    #[test]
    fn test_close_without_position_fails() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        let result = ledger.close(100.0, 100.0, ExitReason::Signal, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_close_computes_exit_slippage() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 1.0)).unwrap();

        let record = ledger
            .close(101.0, 100.0, ExitReason::Signal, Utc::now())
            .unwrap();
        assert!((record.slippage - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_adopt_leaves_budget_untouched() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.adopt(entry_position(100.0, 1.0)).unwrap();

        assert!(ledger.has_position());
        assert_eq!(ledger.budget().current_budget, 500.0);
        assert_eq!(ledger.budget().current_real_balance, 500.0);
    }

    #[test]
    fn test_total_account_value_includes_unrealized() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 1.0)).unwrap();

        ledger.mark_price(90.0);
        assert_eq!(ledger.total_account_value(), 490.0);

        ledger.mark_price(110.0);
        assert_eq!(ledger.total_account_value(), 510.0);
    }

    #[test]
    fn test_unrealized_pnl_never_moves_real_balance() {
        let mut ledger = PositionLedger::new(500.0, FEE_RATE);
        ledger.open(entry_position(100.0, 1.0)).unwrap();

        ledger.mark_price(150.0);
        assert_eq!(ledger.budget().current_real_balance, 500.0);
    }
}
