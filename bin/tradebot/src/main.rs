use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Broker, EnvConfig, TradingMode};
use engine::{shutdown_channel, AlpacaBroker, BotConfig, BrokerKind, CoinbaseBroker, TradingBot};
use orchestrator::StrategyOrchestrator;
use paper::PaperBroker;
use strategy::StrategyRegistry;

/// Multi-strategy trading bot.
#[derive(Debug, Parser)]
#[command(name = "tradebot", version)]
struct Cli {
    /// Bot configuration file.
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ── Config ────────────────────────────────────────────────────────────────
    let env = EnvConfig::from_env().context("Failed to read environment")?;
    let cfg = BotConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    info!(
        bot = %cfg.bot.name,
        mode = %env.trading_mode,
        broker = ?cfg.bot.broker,
        config = %cli.config.display(),
        "Tradebot starting"
    );

    // ── Strategies ────────────────────────────────────────────────────────────
    let registry = StrategyRegistry::from_config(&cfg.strategies, &cfg.strategy.symbols)
        .context("Failed to build strategies")?;
    let orchestrator = StrategyOrchestrator::new(
        registry.into_strategies(),
        cfg.orchestrator.clone(),
        cfg.risk_management.clone(),
        cfg.regime.clone(),
    )
    .context("Failed to build orchestrator")?;

    // ── Broker ────────────────────────────────────────────────────────────────
    let broker = build_broker(&cfg, &env)?;
    if env.trading_mode == TradingMode::Live && cfg.bot.broker != BrokerKind::Paper {
        warn!(broker = %broker.name(), "LIVE TRADING: orders go to a real account");
    }

    let mut bot = TradingBot::new(&cfg, broker, orchestrator).context("Failed to start bot")?;

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(forward_signals(shutdown_tx));

    bot.run(shutdown_rx).await;
    info!("Tradebot stopped");
    Ok(())
}

fn build_broker(cfg: &BotConfig, env: &EnvConfig) -> Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match cfg.bot.broker {
        BrokerKind::Alpaca => Arc::new(AlpacaBroker::new(env.alpaca()?, env.trading_mode)?),
        BrokerKind::Coinbase => {
            if env.trading_mode == TradingMode::Paper {
                warn!("Coinbase has no paper endpoint; orders are real. Use broker = \"paper\" to simulate");
            }
            Arc::new(CoinbaseBroker::new(env.coinbase()?)?)
        }
        BrokerKind::Paper => {
            // Bars still come from a real API; only execution is simulated.
            let feed: Arc<dyn Broker> = match (&env.alpaca, &env.coinbase) {
                (Some(creds), _) => Arc::new(AlpacaBroker::new(creds, TradingMode::Paper)?),
                (None, Some(creds)) => Arc::new(CoinbaseBroker::new(creds)?),
                (None, None) => anyhow::bail!(
                    "paper broker needs Alpaca or Coinbase credentials for market data"
                ),
            };
            info!(
                cash = cfg.bot.paper_starting_cash,
                slippage_bps = cfg.bot.paper_slippage_bps,
                feed = %feed.name(),
                "Paper trading: fills are simulated"
            );
            Arc::new(
                PaperBroker::new(cfg.bot.paper_starting_cash, cfg.bot.paper_slippage_bps).with_market_data(feed),
            )
        }
    };
    Ok(broker)
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
async fn forward_signals(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM; Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received");
    }

    info!("Finishing the current cycle, then shutting down");
    let _ = tx.send(true);
}
