use crate::clock::Clock;
use crate::exchange::{ExchangeClient, ExchangeError, Order, OrderType};
use crate::execution::engine::LiveEngine;
use crate::models::Position;

impl<C: Clock> LiveEngine<C> {
    /// Align engine state with exchange truth before trading starts.
    ///
    /// A nonzero holding of the traded asset is treated as an orphaned
    /// position from a crashed session: the safest resolution is an
    /// immediate market close, with adoption at the current price as the
    /// fallback. Reconciliation errors never fail startup; the engine
    /// proceeds with an empty position set.
    pub async fn reconcile_startup(&mut self) {
        if let Err(e) = self.try_reconcile().await {
            tracing::warn!(
                error = %e,
                "startup reconciliation failed, proceeding with empty position set"
            );
        }
        self.set_running(true);
    }

    async fn try_reconcile(&mut self) -> Result<(), ExchangeError> {
        let symbol = self.config().symbol.clone();

        self.exchange().load_markets().await?;
        let market = self
            .exchange()
            .market(&symbol)
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.clone()))?;
        let balances = self.exchange().fetch_balance().await?;
        let open_orders = self.exchange().fetch_open_orders(&symbol).await?;

        let base_free = balances.get(&market.base).map(|b| b.free).unwrap_or(0.0);
        let holding = market.amount_to_precision(base_free);

        if holding >= market.min_amount && holding > 0.0 {
            let ticker = self.exchange().fetch_ticker(&symbol).await?;
            tracing::warn!(
                amount = holding,
                price = ticker.last,
                "found orphaned holding from a previous session"
            );
            self.resolve_orphan(holding, ticker.last).await;
        } else if base_free > 0.0 {
            tracing::debug!(
                amount = base_free,
                "ignoring dust holding below the exchange minimum"
            );
        }

        self.cancel_unbound_stops(&open_orders).await;
        Ok(())
    }

    /// Close the orphan at market; if that fails, adopt it as a position
    /// with entry at the current price (zero unrealized P&L) and let the
    /// strategy resynchronize its own tracking
    async fn resolve_orphan(&mut self, amount: f64, price: f64) {
        let symbol = self.config().symbol.clone();

        match self.exchange().create_market_sell_order(&symbol, amount).await {
            Ok(order) => {
                if let Some((fill_price, _)) = self.verify_fill(&order, price).await {
                    tracing::info!(price = fill_price, "orphaned holding closed at market");
                    return;
                }
                tracing::warn!("orphan close did not fill, adopting position instead");
            }
            Err(e) => {
                tracing::warn!(error = %e, "orphan close failed, adopting position instead");
            }
        }

        let position = Position {
            symbol,
            amount,
            entry_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
            stop_order_id: None,
            software_stop: false,
            entry_time: self.clock_now(),
            expected_price: price,
            actual_fill_price: price,
            slippage: 0.0,
        };
        if let Err(e) = self.ledger_mut().adopt(position) {
            tracing::error!(error = %e, "could not adopt orphaned position");
            return;
        }
        self.strategy_mut().restore_position_state(price, price);
        tracing::info!(amount, entry = price, "adopted orphaned holding as position");
    }

    /// Cancel stop-loss-type orders not bound to the tracked position
    async fn cancel_unbound_stops(&self, open_orders: &[Order]) {
        let symbol = &self.config().symbol;
        let bound = self.ledger().position().and_then(|p| p.stop_order_id.clone());

        for order in open_orders
            .iter()
            .filter(|o| o.order_type == OrderType::StopLossLimit)
        {
            if bound.as_deref() == Some(order.id.as_str()) {
                continue;
            }
            match self.exchange().cancel_order(&order.id, symbol).await {
                Ok(()) => {
                    tracing::info!(order_id = %order.id, "cancelled unbound stop order");
                }
                Err(e) if e.is_order_gone() => {}
                Err(e) => {
                    tracing::warn!(
                        order_id = %order.id,
                        error = %e,
                        "failed to cancel unbound stop order"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::PaperExchange;
    use crate::execution::engine::EngineConfig;
    use crate::models::{Candle, Signal};
    use crate::risk::RiskLimits;
    use crate::strategy::Strategy;

    /// Records restore calls so tests can assert the fallback path ran
    struct RecordingStrategy {
        restored: Arc<Mutex<Option<(f64, f64)>>>,
    }

    impl Strategy for RecordingStrategy {
        fn name(&self) -> &str {
            "RecordingStrategy"
        }

        fn analyze(&mut self, _candles: &[Candle], current_price: f64) -> Signal {
            Signal::hold(current_price, "recording")
        }

        fn restore_position_state(&mut self, entry_price: f64, current_price: f64) {
            *self.restored.lock().unwrap() = Some((entry_price, current_price));
        }
    }

    fn recording_engine(
        paper: &Arc<PaperExchange>,
    ) -> (LiveEngine<ManualClock>, Arc<Mutex<Option<(f64, f64)>>>) {
        let restored = Arc::new(Mutex::new(None));
        let strategy = RecordingStrategy {
            restored: restored.clone(),
        };
        let config = EngineConfig {
            bot_name: "test-bot".to_string(),
            symbol: "BTCUSDT".to_string(),
            initial_budget: 500.0,
            fill_verify_wait: std::time::Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let engine = LiveEngine::new(
            config,
            RiskLimits::default(),
            paper.clone(),
            Box::new(strategy),
            ManualClock::new(Utc::now()),
        );
        (engine, restored)
    }

    #[tokio::test]
    async fn test_clean_startup_has_no_position() {
        let paper = Arc::new(PaperExchange::for_symbol("BTCUSDT", 100.0, 500.0));
        let (mut engine, restored) = recording_engine(&paper);

        engine.reconcile_startup().await;

        assert!(engine.is_running());
        assert!(!engine.ledger().has_position());
        assert!(restored.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphaned_holding_is_closed_at_market() {
        let paper = Arc::new(PaperExchange::for_symbol("BTCUSDT", 100.0, 500.0));
        paper.set_balance("BTC", 0.5);
        // Stray stop order left behind by the crashed session
        paper
            .create_stop_loss_limit_order("BTCUSDT", 0.5, 94.5, 95.0)
            .await
            .unwrap();

        let (mut engine, restored) = recording_engine(&paper);
        engine.reconcile_startup().await;

        // The holding was sold and nothing was adopted
        assert!(!engine.ledger().has_position());
        assert_eq!(paper.balance_of("BTC"), 0.0);
        assert!(restored.lock().unwrap().is_none());

        // Stop orders for the symbol were cancelled
        assert_eq!(paper.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_failed_close_adopts_position_at_current_price() {
        let paper = Arc::new(PaperExchange::for_symbol("BTCUSDT", 100.0, 500.0));
        paper.set_balance("BTC", 0.5);
        paper
            .create_stop_loss_limit_order("BTCUSDT", 0.5, 94.5, 95.0)
            .await
            .unwrap();
        paper.set_reject_orders(true);

        let (mut engine, restored) = recording_engine(&paper);
        engine.reconcile_startup().await;

        // Adopted with zero unrealized P&L and an untouched budget
        let position = engine.ledger().position().expect("position adopted");
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.amount, 0.5);
        assert_eq!(position.unrealized_pnl, 0.0);
        assert_eq!(engine.ledger().budget().current_budget, 500.0);

        // The strategy was told to resynchronize
        assert_eq!(*restored.lock().unwrap(), Some((100.0, 100.0)));

        // Unbound stop orders are still swept
        assert_eq!(paper.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_dust_holding_is_ignored() {
        let paper = Arc::new(PaperExchange::for_symbol("BTCUSDT", 100.0, 500.0));
        paper.set_min_amount("BTCUSDT", 0.001);
        paper.set_balance("BTC", 0.0005);

        let (mut engine, _restored) = recording_engine(&paper);
        engine.reconcile_startup().await;

        assert!(!engine.ledger().has_position());
        assert_eq!(paper.balance_of("BTC"), 0.0005);
    }

    #[tokio::test]
    async fn test_reconciliation_errors_do_not_fail_startup() {
        let paper = Arc::new(PaperExchange::for_symbol("BTCUSDT", 100.0, 500.0));
        paper.set_offline(true);

        let (mut engine, _restored) = recording_engine(&paper);
        engine.reconcile_startup().await;

        assert!(engine.is_running());
        assert!(!engine.ledger().has_position());
    }
}
