// =============================================================================
// tradewind — USDT-M perpetual-futures decision engine
// =============================================================================
//
// Entry point. Modes:
//   demo  : synthetic end-to-end pipeline            [dev, gated]
//   data  : real snapshots, no trading               [dev, gated]
//   paper : decisions + simulated fills (default)
//   live  : real orders; requires LIVE_CONFIRM=1
//
// Exit codes: 0 on graceful stop, 1 on configuration error (unknown mode,
// live without confirmation, broken timeframe lock).
//
// Operational constraint: one engine instance per data directory. Every
// persistence path is single-writer by design.
// =============================================================================

mod config;
mod datasets;
mod decision;
mod errors;
mod events;
mod exchange;
mod features;
mod indicators;
mod notify;
mod policy;
mod reward;
mod risk_engine;
mod risk_guard;
mod runtime;
mod scorer;
mod snapshot;
mod snapshot_builder;
mod storage;
mod trade;
mod types;
mod universe;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::EventBus;
use crate::exchange::UsdtmClient;
use crate::notify::TelegramNotifier;
use crate::runtime::Runtime;

fn ensure_dirs() {
    for p in [
        "logs",
        "data/runtime",
        "data/runtime/snapshots",
        "data/datasets/rl",
        "data/datasets/market",
        "data/datasets/supervised",
        "models",
    ] {
        if let Err(e) = std::fs::create_dir_all(p) {
            warn!(path = p, error = %e, "failed to create data directory");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Env first: operators run this under systemd/tmux where the env file is
    // the only configuration channel.
    let env_file = dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match &env_file {
        Some(path) => info!(path = %path.display(), "env loaded"),
        None => info!("env loaded from process environment only"),
    }

    // Configuration errors are fatal (exit code 1 via the error return).
    let cfg = Config::from_env().context("configuration error")?;

    if cfg.telegram_enabled && (cfg.telegram_token.is_empty() || cfg.telegram_chat_id.is_empty()) {
        warn!("Telegram is enabled but TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID is missing");
    }

    ensure_dirs();

    info!(
        mode = %cfg.mode,
        exchange = %cfg.exchange.venue,
        cycle_sec = cfg.cycle_sec,
        policy = ?cfg.policy,
        "starting tradewind"
    );

    let client = Arc::new(UsdtmClient::new(
        cfg.exchange.venue,
        cfg.exchange.api_key.clone(),
        cfg.exchange.api_secret.clone(),
        cfg.exchange.testnet,
        cfg.exchange.timeout_ms,
        cfg.exchange.rate_limit,
    )?);

    let bus = Arc::new(EventBus::new());
    if cfg.telegram_enabled {
        if let Some(notifier) = TelegramNotifier::from_config(&cfg.telegram_token, &cfg.telegram_chat_id)
        {
            Arc::new(notifier).attach(&bus);
            info!("telegram notifier attached");
        }
    }

    let mut runtime = Runtime::new(cfg, client, bus)?;

    // The loop runs until SIGINT; any cycle failure is contained inside.
    let loop_handle = tokio::spawn(async move {
        if let Err(e) = runtime.run().await {
            error!(error = %e, "runtime loop terminated");
        }
    });

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    loop_handle.abort();

    info!("tradewind shut down complete");
    Ok(())
}
