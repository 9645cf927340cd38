//! FusionBot entry point
//!
//! Usage: cargo run --release
//!
//! Loads configuration, restores engine state, warms the candle buffers
//! from Binance klines and trades the live stream until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fusionbot::config::AppConfig;
use fusionbot::engine::{EngineSettings, Orchestrator};
use fusionbot::execution::{BinanceRestClient, ExecutionEngine, OrderPlacer};
use fusionbot::notify::{LogNotifier, Notifier};
use fusionbot::oracle::sources::{BinanceClient, BinanceHistory};
use fusionbot::persistence::{JsonFileStore, TradeJournal};
use fusionbot::risk::AdaptiveRiskSizer;
use fusionbot::strategy::{MomentumSource, SignalFusionEngine};
use fusionbot::types::SystemClock;

fn init_tracing(cfg: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    if cfg.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&cfg);

    info!("🤖 FusionBot {} starting", cfg.bot.tag);
    info!("⚙️ {}", cfg.digest());

    let clock = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let store = Arc::new(JsonFileStore::new(cfg.state_path()));
    let mut execution = ExecutionEngine::open(
        cfg.execution.clone(),
        cfg.risk.clone(),
        store,
        clock.clone(),
    )
    .context("Failed to restore engine state")?
    .with_notifier(notifier.clone());

    if cfg.persistence.journal_enabled {
        let path = cfg.journal_path();
        info!(path = %path.display(), "📒 Trade journal enabled");
        execution = execution.with_journal(TradeJournal::new(path));
    }

    if !cfg.execution.paper {
        let client = BinanceRestClient::new(
            &cfg.exchange.rest_url,
            cfg.exchange.api_key.as_deref().unwrap_or_default(),
            cfg.exchange.api_secret.as_deref().unwrap_or_default(),
        )
        .context("Failed to build exchange client")?;
        match client.get_balance(&cfg.exchange.quote_asset).await {
            Ok(balance) => info!(
                asset = %cfg.exchange.quote_asset,
                balance,
                "💰 Exchange balance"
            ),
            Err(e) => warn!(error = %e, "⚠️ Could not read exchange balance"),
        }
        execution = execution.with_placer(Arc::new(client));
    } else {
        info!("📝 Paper trading mode");
    }
    let execution = Arc::new(execution);

    let orchestrator = Orchestrator::new(
        EngineSettings::from(&cfg),
        cfg.aggregator_config(),
        &cfg.estimator,
        SignalFusionEngine::new(cfg.fusion.clone()),
        AdaptiveRiskSizer::new(cfg.sizer.clone()),
        execution.clone(),
        clock,
    )
    .context("Invalid candle configuration")?
    .with_source(Arc::new(MomentumSource::default()))
    .with_notifier(notifier);
    let orchestrator = Arc::new(orchestrator);

    match BinanceHistory::new(&cfg.oracle.rest_url) {
        Ok(history) => {
            orchestrator.bootstrap(&history).await;
        }
        Err(e) => warn!(error = %e, "⚠️ Skipping bootstrap, history client unavailable"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        let _ = shutdown_tx.send(true);
    });

    let source = Box::new(BinanceClient::new(&cfg.oracle.ws_url));
    orchestrator.run(source, shutdown_rx).await?;

    info!("👋 FusionBot stopped");
    Ok(())
}
