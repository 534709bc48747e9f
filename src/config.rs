use serde::Deserialize;

use crate::risk::RiskLimits;

/// Runtime settings for one bot instance
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bot_name: String,
    /// Trading pair, e.g. BTCUSDT
    pub symbol: String,
    /// Strategy variant name, resolved through the registry
    pub strategy: String,
    /// Capital allocated to this instance
    pub initial_budget: f64,
    /// Per-side trading fee, e.g. 0.00075 for 0.075%
    pub fee_rate: f64,
    pub poll_interval_secs: u64,
    /// Candles kept in the rolling history window
    pub candle_window: usize,
    pub risk: RiskLimits,
}

impl Settings {
    /// Built-in defaults overlaid with `SPOTBOT_`-prefixed environment
    /// variables, e.g. `SPOTBOT_SYMBOL=ETHUSDT` or
    /// `SPOTBOT_RISK__MAX_DRAWDOWN_PCT=0.10`
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("bot_name", "spotbot")?
            .set_default("symbol", "BTCUSDT")?
            .set_default("strategy", "threshold")?
            .set_default("initial_budget", 500.0)?
            .set_default("fee_rate", 0.00075)?
            .set_default("poll_interval_secs", 60_i64)?
            .set_default("candle_window", 288_i64)?
            .set_default("risk.max_drawdown_pct", 0.15)?
            .set_default("risk.max_daily_loss_pct", 0.05)?
            .set_default("risk.max_hourly_loss_pct", 0.02)?
            .set_default("risk.max_trades_per_day", 10_i64)?
            .set_default("risk.max_consecutive_losses", 3_i64)?
            .set_default("risk.half_size_after_losses", 2_i64)?
            .set_default("risk.half_size_multiplier", 0.5)?
            .set_default("risk.max_position_pct", 0.15)?
            .set_default("risk.order_pct", 0.12)?
            .set_default("risk.slippage_warn_pct", 0.001)?
            .add_source(config::Environment::with_prefix("SPOTBOT").separator("__"))
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }
}
