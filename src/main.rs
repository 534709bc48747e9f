use std::sync::Arc;

use clap::Parser;
use tokio::time::{interval, Duration, MissedTickBehavior};

use spotbot::clock::SystemClock;
use spotbot::config::Settings;
use spotbot::exchange::{BinanceClient, ExchangeClient, PaperExchange};
use spotbot::execution::{CandleBuffer, EngineConfig, LiveEngine, TickOutcome};
use spotbot::strategy;

/// Seed price for the paper exchange until real ticks arrive
const PAPER_SEED_PRICE: f64 = 100.0;
const SUMMARY_EVERY_TICKS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "spotbot", about = "Risk-gated spot trading bot")]
struct Cli {
    /// Trading pair, e.g. BTCUSDT
    #[arg(long)]
    symbol: Option<String>,

    /// Capital allocated to this bot instance
    #[arg(long)]
    budget: Option<f64>,

    /// Strategy variant name
    #[arg(long)]
    strategy: Option<String>,

    /// Seconds between ticks
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Trade against the in-memory paper exchange instead of Binance
    #[arg(long)]
    paper: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(symbol) = cli.symbol {
        settings.symbol = symbol;
    }
    if let Some(budget) = cli.budget {
        settings.initial_budget = budget;
    }
    if let Some(strategy_name) = cli.strategy {
        settings.strategy = strategy_name;
    }
    if let Some(interval_secs) = cli.interval_secs {
        settings.poll_interval_secs = interval_secs;
    }

    tracing::info!("🚀 spotbot starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {}", settings.symbol);
    tracing::info!("  Strategy: {}", settings.strategy);
    tracing::info!("  Budget: ${:.2}", settings.initial_budget);
    tracing::info!("  Max Drawdown: {}%", settings.risk.max_drawdown_pct * 100.0);
    tracing::info!(
        "  Max Daily Loss: {}%",
        settings.risk.max_daily_loss_pct * 100.0
    );
    tracing::info!("  Tick Interval: {}s", settings.poll_interval_secs);

    let strategy = strategy::create(&settings.strategy).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown strategy '{}', known variants: {:?}",
            settings.strategy,
            strategy::variants()
        )
    })?;

    let exchange: Arc<dyn ExchangeClient> = if cli.paper {
        tracing::info!("📝 Paper trading mode - no real orders will be placed");
        Arc::new(PaperExchange::for_symbol(
            &settings.symbol,
            PAPER_SEED_PRICE,
            settings.initial_budget,
        ))
    } else {
        let api_key = std::env::var("BINANCE_API_KEY")
            .map_err(|_| anyhow::anyhow!("BINANCE_API_KEY not found in environment"))?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .map_err(|_| anyhow::anyhow!("BINANCE_API_SECRET not found in environment"))?;
        Arc::new(BinanceClient::new(api_key, api_secret))
    };

    let engine_config = EngineConfig {
        bot_name: settings.bot_name.clone(),
        symbol: settings.symbol.clone(),
        initial_budget: settings.initial_budget,
        fee_rate: settings.fee_rate,
        ..EngineConfig::default()
    };
    let mut engine = LiveEngine::new(
        engine_config,
        settings.risk.clone(),
        exchange.clone(),
        strategy,
        SystemClock,
    );

    tracing::info!("🔍 Reconciling engine state against the exchange...");
    engine.reconcile_startup().await;

    let mut candles = CandleBuffer::new(settings.candle_window);
    let mut ticker = interval(Duration::from_secs(settings.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("✅ Engine running, press Ctrl+C to stop\n");

    let mut tick_count: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                tick_count += 1;
                run_tick(&mut engine, &exchange, &mut candles, &settings.symbol).await;
                if tick_count % SUMMARY_EVERY_TICKS == 0 {
                    log_summary(&engine);
                }
            }
        }
    }

    log_summary(&engine);
    tracing::info!("👋 spotbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "spotbot=info".to_string()))
        .init();
}

/// One engine tick: poll the ticker, extend history, run the strategy and
/// act on its signal. Failures are logged and the loop keeps going; the
/// engine never takes the process down over an exchange-side error.
async fn run_tick(
    engine: &mut LiveEngine,
    exchange: &Arc<dyn ExchangeClient>,
    candles: &mut CandleBuffer,
    symbol: &str,
) {
    let ticker = match exchange.fetch_ticker(symbol).await {
        Ok(ticker) => ticker,
        Err(e) => {
            tracing::error!(error = %e, "ticker fetch failed, skipping tick");
            return;
        }
    };
    candles.push_price(ticker.last, ticker.timestamp);

    match engine.on_tick(&candles.candles(), ticker.last).await {
        Ok(TickOutcome::Opened { amount, fill_price }) => {
            tracing::info!(amount, price = fill_price, "✓ position opened");
        }
        Ok(TickOutcome::Closed { trade }) => {
            tracing::info!(
                profit = trade.profit,
                win = trade.win,
                reason = %trade.reason,
                "✓ position closed"
            );
        }
        Ok(TickOutcome::Halted { halt }) => {
            tracing::warn!(%halt, "risk gate halt");
        }
        Ok(TickOutcome::NoAction { reason }) => {
            tracing::debug!(%reason, "no action");
        }
        Err(e) => {
            tracing::error!(error = %e, "tick aborted");
        }
    }
}

fn log_summary(engine: &LiveEngine) {
    let report = engine.report();

    tracing::info!("\n📊 Portfolio Summary:");
    tracing::info!(
        "  Budget: ${:.2} (allocated ${:.2})",
        report.current_budget,
        report.initial_budget
    );
    tracing::info!(
        "  Real Balance: ${:.2} (drawdown {:.2}%)",
        report.current_real_balance,
        report.current_drawdown_pct
    );
    tracing::info!(
        "  Trades: {} ({} wins, win rate {:.1}%)",
        report.total_trades,
        report.winning_trades,
        report.win_rate
    );
    tracing::info!("  Total P&L: ${:.2}", report.total_pnl);

    if let Some(position) = &report.open_position {
        tracing::info!(
            "  Open: {:.6} {} @ ${:.4} (P&L ${:.2})",
            position.amount,
            position.symbol,
            position.entry_price,
            position.unrealized_pnl
        );
    }
    if report.emergency_stop_triggered {
        tracing::warn!("  ⛔ EMERGENCY STOP ACTIVE - restart required to resume trading");
    }
}
