use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::{Clock, IntervalGate, SystemClock};
use crate::exchange::{ExchangeClient, ExchangeError, Order, OrderType};
use crate::execution::ledger::PositionLedger;
use crate::models::{Candle, ExitReason, Position, Signal, SignalAction, TradeRecord};
use crate::risk::{GateContext, RiskHalt, RiskLimits, RiskState};
use crate::stats::EngineReport;
use crate::strategy::Strategy;

/// Engine settings that are not risk thresholds
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bot_name: String,
    pub symbol: String,
    /// Capital allocated to this instance for sizing and P&L tracking
    pub initial_budget: f64,
    /// Per-side trading fee, e.g. 0.00075 for 0.075%
    pub fee_rate: f64,
    /// Single bounded wait before re-fetching an unfilled order
    pub fill_verify_wait: std::time::Duration,
    /// Re-probe connectivity at most this often
    pub health_probe_every: Duration,
    /// Verify tracked balance against the exchange at most this often
    pub balance_check_every: Duration,
    /// Stop-limit price sits this fraction below the stop trigger
    pub stop_limit_offset_pct: f64,
    /// Tracked-vs-exchange balance drift above this fraction is logged
    pub balance_drift_warn_pct: f64,
    /// Shared-account heuristic: allocation under `free * factor` means
    /// other bots share this exchange account
    pub shared_balance_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bot_name: "spotbot".to_string(),
            symbol: "BTCUSDT".to_string(),
            initial_budget: 1000.0,
            fee_rate: 0.00075,
            fill_verify_wait: std::time::Duration::from_secs(2),
            health_probe_every: Duration::seconds(60),
            balance_check_every: Duration::minutes(10),
            stop_limit_offset_pct: 0.005,
            balance_drift_warn_pct: 0.01,
            shared_balance_factor: 0.5,
        }
    }
}

/// How one tick resolved.
///
/// `Halted` and `NoAction` are deliberate outcomes; infrastructure failures
/// surface as `Err` from `process_signal` and the driver is expected to log
/// them and keep ticking.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Opened { amount: f64, fill_price: f64 },
    Closed { trade: TradeRecord },
    Halted { halt: RiskHalt },
    NoAction { reason: String },
}

fn no_action(reason: impl Into<String>) -> TickOutcome {
    TickOutcome::NoAction {
        reason: reason.into(),
    }
}

/// Exchange reachability as of the last probe
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Risk-gated order-execution engine for one bot/strategy pair.
///
/// Single logical thread of control: signals are processed serially and all
/// exchange calls within a tick are awaited in sequence.
pub struct LiveEngine<C: Clock = SystemClock> {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    strategy: Box<dyn Strategy>,
    clock: C,
    limits: RiskLimits,
    risk: RiskState,
    ledger: PositionLedger,
    health: ConnectionHealth,
    health_gate: IntervalGate,
    balance_gate: IntervalGate,
    multi_bot_mode: bool,
    running: bool,
}

impl<C: Clock> LiveEngine<C> {
    pub fn new(
        config: EngineConfig,
        limits: RiskLimits,
        exchange: Arc<dyn ExchangeClient>,
        strategy: Box<dyn Strategy>,
        clock: C,
    ) -> Self {
        let now = clock.now();
        let ledger = PositionLedger::new(config.initial_budget, config.fee_rate);
        let risk = RiskState::new(config.initial_budget, now);
        let health_gate = IntervalGate::new(config.health_probe_every);
        let balance_gate = IntervalGate::new(config.balance_check_every);

        Self {
            config,
            exchange,
            strategy,
            clock,
            limits,
            risk,
            ledger,
            health: ConnectionHealth {
                healthy: true,
                last_checked: None,
            },
            health_gate,
            balance_gate,
            multi_bot_mode: false,
            running: false,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    pub(crate) fn strategy_mut(&mut self) -> &mut dyn Strategy {
        self.strategy.as_mut()
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut PositionLedger {
        &mut self.ledger
    }

    pub(crate) fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Snapshot of performance and risk flags for external monitoring
    pub fn report(&self) -> EngineReport {
        EngineReport::compute(
            &self.config.bot_name,
            self.strategy.name(),
            &self.config.symbol,
            self.running,
            &self.ledger,
            &self.risk,
            self.health.healthy,
            self.multi_bot_mode,
            self.clock.now(),
        )
    }

    /// Run the strategy against current history and act on its signal
    pub async fn on_tick(
        &mut self,
        candles: &[Candle],
        current_price: f64,
    ) -> anyhow::Result<TickOutcome> {
        let signal = self.strategy.analyze(candles, current_price);
        tracing::debug!(action = ?signal.action, reason = %signal.reason, "strategy signal");
        self.process_signal(&signal, current_price).await
    }

    /// Risk-gate a signal, execute it if permitted, then run the
    /// exit-condition check against the (possibly new) position
    pub async fn process_signal(
        &mut self,
        signal: &Signal,
        current_price: f64,
    ) -> anyhow::Result<TickOutcome> {
        let now = self.clock.now();
        self.ledger.mark_price(current_price);

        // A latched emergency stop rejects the tick before any exchange
        // call is made; only a restart clears it.
        if self.risk.emergency_stop_triggered {
            return Ok(TickOutcome::Halted {
                halt: RiskHalt::EmergencyStop,
            });
        }

        // Gate check 1: connection health. Failure aborts the tick as a
        // local error with no side effects; the next tick re-probes.
        self.check_connection(now).await?;

        self.verify_balance_if_due(now).await;

        let opening = signal.action == SignalAction::Buy && !self.ledger.has_position();
        let ctx = GateContext {
            now,
            total_account_value: self.ledger.total_account_value(),
            opening_new_position: opening,
        };
        if let Err(halt) = self.limits.evaluate(&mut self.risk, self.ledger.budget(), &ctx) {
            if halt == RiskHalt::Drawdown {
                tracing::warn!(%halt, "emergency stop latched, liquidating open position");
                self.force_liquidate(current_price, now).await;
            } else {
                tracing::warn!(%halt, action = ?signal.action, "risk gate refused signal");
            }
            return Ok(TickOutcome::Halted { halt });
        }

        let outcome = match signal.action {
            SignalAction::Buy if self.ledger.has_position() => no_action("position already open"),
            SignalAction::Buy => self.execute_buy(signal, current_price, now).await?,
            SignalAction::Sell | SignalAction::Close if self.ledger.has_position() => {
                self.execute_close(ExitReason::Signal, current_price, now)
                    .await?
            }
            SignalAction::Sell | SignalAction::Close => no_action("no open position"),
            SignalAction::Hold => no_action(signal.reason.clone()),
        };

        // Exit-condition check: independent of the incoming signal, at most
        // one exit actioned per tick
        if self.ledger.has_position() {
            if let Some(reason) = self.pending_exit(current_price) {
                tracing::info!(%reason, price = current_price, "exit condition met");
                return self.execute_close(reason, current_price, now).await;
            }
        }

        Ok(outcome)
    }

    async fn check_connection(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if self.health.healthy && !self.health_gate.due(now) {
            return Ok(());
        }

        self.health_gate.mark(now);
        match self.exchange.fetch_time().await {
            Ok(_) => {
                self.health.healthy = true;
                self.health.last_checked = Some(now);
                Ok(())
            }
            Err(e) => {
                self.health.healthy = false;
                self.health.last_checked = Some(now);
                tracing::error!(error = %e, "connection probe failed, aborting tick");
                Err(anyhow::Error::new(e).context("exchange connection unhealthy"))
            }
        }
    }

    /// Lazily verify tracked balance against exchange truth.
    ///
    /// In shared-account ("multi-bot") mode verification is skipped and P&L
    /// stays tracked against the allocated budget only. Drift is logged,
    /// never written back: the real-balance invariant belongs to the ledger.
    async fn verify_balance_if_due(&mut self, now: DateTime<Utc>) {
        if !self.balance_gate.due(now) {
            return;
        }
        self.balance_gate.mark(now);

        let balances = match self.exchange.fetch_balance().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error = %e, "balance verification skipped");
                return;
            }
        };
        let quote = match self.exchange.market(&self.config.symbol) {
            Some(m) => m.quote,
            None => return,
        };
        let free = balances.get(&quote).map(|b| b.free).unwrap_or(0.0);

        let multi_bot =
            self.ledger.budget().initial_budget < free * self.config.shared_balance_factor;
        if multi_bot != self.multi_bot_mode {
            tracing::info!(multi_bot, "shared-balance mode changed");
            self.multi_bot_mode = multi_bot;
        }
        if multi_bot {
            return;
        }

        let tracked = self.ledger.budget().current_real_balance;
        if tracked > 0.0 {
            let drift = (free - tracked).abs() / tracked;
            if drift > self.config.balance_drift_warn_pct {
                tracing::warn!(
                    tracked,
                    exchange_free = free,
                    drift_pct = drift * 100.0,
                    "tracked balance drifting from exchange balance"
                );
            }
        }
    }

    async fn execute_buy(
        &mut self,
        signal: &Signal,
        expected_price: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TickOutcome> {
        let symbol = self.config.symbol.clone();

        let budget = self.ledger.budget().current_budget;
        let notional = f64::min(
            budget * self.limits.max_position_pct,
            budget * self.limits.order_pct,
        ) * self.risk.position_size_multiplier;
        if notional <= 0.0 {
            return Ok(no_action("no budget available"));
        }

        let market = match self.exchange.market(&symbol) {
            Some(m) => m,
            None => {
                tracing::error!(%symbol, "market metadata missing, cannot size order");
                return Ok(no_action("market metadata missing"));
            }
        };
        let amount = market.amount_to_precision(notional / expected_price);
        if amount < market.min_amount {
            tracing::info!(
                amount,
                min_amount = market.min_amount,
                "order below exchange minimum, skipping entry"
            );
            return Ok(no_action("order below exchange minimum"));
        }

        let order = match self.exchange.create_market_buy_order(&symbol, amount).await {
            Ok(order) => order,
            Err(e) => return Ok(self.note_order_failure("buy", e)),
        };

        let Some((fill_price, filled)) = self.verify_fill(&order, expected_price).await else {
            tracing::warn!(order_id = %order.id, "buy not filled after wait, abandoning entry");
            return Ok(no_action("buy order unfilled"));
        };

        let slippage = (fill_price - expected_price).abs() / expected_price;
        if slippage > self.limits.slippage_warn_pct {
            tracing::warn!(
                slippage_pct = slippage * 100.0,
                expected = expected_price,
                actual = fill_price,
                "entry slippage above threshold"
            );
        }

        let position = Position {
            symbol: symbol.clone(),
            amount: filled,
            entry_price: fill_price,
            current_price: fill_price,
            unrealized_pnl: 0.0,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            stop_order_id: None,
            software_stop: false,
            entry_time: now,
            expected_price,
            actual_fill_price: fill_price,
            slippage,
        };
        self.ledger.open(position)?;
        self.risk.daily_trade_count += 1;
        self.strategy.record_trade();

        tracing::info!(
            amount = filled,
            price = fill_price,
            budget = self.ledger.budget().current_budget,
            "opened position"
        );

        if let Some(stop_price) = signal.stop_loss {
            self.place_stop_order(stop_price, filled).await;
        }

        Ok(TickOutcome::Opened {
            amount: filled,
            fill_price,
        })
    }

    /// Place the exchange-side stop for a fresh position; on rejection the
    /// position degrades to software-monitored exits instead of failing
    async fn place_stop_order(&mut self, stop_price: f64, amount: f64) {
        let symbol = self.config.symbol.clone();
        let market = match self.exchange.market(&symbol) {
            Some(m) => m,
            None => return,
        };
        let stop = market.price_to_precision(stop_price);
        let limit =
            market.price_to_precision(stop_price * (1.0 - self.config.stop_limit_offset_pct));

        match self
            .exchange
            .create_stop_loss_limit_order(&symbol, amount, limit, stop)
            .await
        {
            Ok(order) => {
                tracing::info!(order_id = %order.id, stop, limit, "exchange-side stop placed");
                if let Some(position) = self.ledger.position_mut() {
                    position.stop_order_id = Some(order.id);
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "stop order rejected, falling back to software-monitored exit"
                );
                if let Some(position) = self.ledger.position_mut() {
                    position.software_stop = true;
                }
            }
        }
    }

    async fn execute_close(
        &mut self,
        reason: ExitReason,
        expected_price: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TickOutcome> {
        let symbol = self.config.symbol.clone();
        let (amount, stop_order_id) = match self.ledger.position() {
            Some(p) => (p.amount, p.stop_order_id.clone()),
            None => return Ok(no_action("no open position")),
        };

        // Cancel the bound stop before selling; "already gone" is expected
        if let Some(id) = stop_order_id {
            if let Err(e) = self.exchange.cancel_order(&id, &symbol).await {
                if !e.is_order_gone() {
                    tracing::warn!(order_id = %id, error = %e, "failed to cancel bound stop order");
                }
            }
        }

        let order = match self.exchange.create_market_sell_order(&symbol, amount).await {
            Ok(order) => order,
            Err(e) => return Ok(self.note_order_failure("sell", e)),
        };

        let Some((fill_price, _)) = self.verify_fill(&order, expected_price).await else {
            tracing::warn!(order_id = %order.id, "sell not filled after wait, abandoning close");
            return Ok(no_action("sell order unfilled"));
        };

        let trade = self.ledger.close(fill_price, expected_price, reason, now)?;
        self.risk.record_trade_result(trade.profit, now, &self.limits);

        if trade.slippage > self.limits.slippage_warn_pct {
            tracing::warn!(
                slippage_pct = trade.slippage * 100.0,
                "exit slippage above threshold"
            );
        }
        tracing::info!(
            profit = trade.profit,
            win = trade.win,
            reason = %trade.reason,
            balance = self.ledger.budget().current_real_balance,
            "closed position"
        );

        self.sweep_stray_stops().await;

        Ok(TickOutcome::Closed { trade })
    }

    /// Fill verification: accept an immediate fill, otherwise wait once and
    /// re-fetch by id. No retry loop beyond the single wait. Returns the
    /// average fill price and filled amount.
    pub(crate) async fn verify_fill(&self, order: &Order, expected_price: f64) -> Option<(f64, f64)> {
        if order.filled > 0.0 {
            return Some((order.average.unwrap_or(expected_price), order.filled));
        }

        tokio::time::sleep(self.config.fill_verify_wait).await;

        match self.exchange.fetch_order(&order.id, &order.symbol).await {
            Ok(refetched) if refetched.filled > 0.0 => Some((
                refetched.average.unwrap_or(expected_price),
                refetched.filled,
            )),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "fill verification failed");
                None
            }
        }
    }

    fn note_order_failure(&mut self, action: &str, err: ExchangeError) -> TickOutcome {
        if err.is_connectivity() {
            self.health.healthy = false;
        }
        tracing::error!(action, error = %err, "order failed, action aborted");
        no_action(format!("{action} order failed: {err}"))
    }

    /// Best-effort cleanup of remaining stop orders for the symbol
    async fn sweep_stray_stops(&self) {
        let symbol = &self.config.symbol;
        let orders = match self.exchange.fetch_open_orders(symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::debug!(error = %e, "stray stop sweep skipped");
                return;
            }
        };
        for order in orders
            .iter()
            .filter(|o| o.order_type == OrderType::StopLossLimit)
        {
            if let Err(e) = self.exchange.cancel_order(&order.id, symbol).await {
                if !e.is_order_gone() {
                    tracing::debug!(order_id = %order.id, error = %e, "failed to cancel stray stop");
                }
            }
        }
    }

    fn pending_exit(&self, price: f64) -> Option<ExitReason> {
        let position = self.ledger.position()?;
        if let Some(stop) = position.stop_loss {
            if price <= stop {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(target) = position.take_profit {
            if price >= target {
                return Some(ExitReason::TakeProfit);
            }
        }
        None
    }

    /// Forced liquidation after the drawdown latch fires. Failures are
    /// logged and swallowed; the halt stands either way.
    async fn force_liquidate(&mut self, price: f64, now: DateTime<Utc>) {
        if !self.ledger.has_position() {
            return;
        }
        match self.execute_close(ExitReason::EmergencyStop, price, now).await {
            Ok(TickOutcome::Closed { trade }) => {
                tracing::warn!(profit = trade.profit, "position force-closed by emergency stop");
            }
            Ok(outcome) => {
                tracing::error!(?outcome, "emergency liquidation did not complete");
            }
            Err(e) => {
                tracing::error!(error = %e, "emergency liquidation failed");
            }
        }
    }
}
