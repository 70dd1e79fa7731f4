//! Coin ledger server binary
//!
//! Runs the ledger against the simulated bank with logging trackers. Reads
//! its configuration from the TOML file named by `COIN_LEDGER_CONFIG`, or
//! from `COIN_LEDGER_*` variables.

use anyhow::Context;
use coin_ledger::{CoinLedger, Config, SimulatedBank, Sinks, TracingSink};
use prometheus::Encoder;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Troll City coin ledger");

    let config = match std::env::var("COIN_LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("reading COIN_LEDGER_* environment")?,
    };

    let ledger = CoinLedger::open(
        config,
        Arc::new(SimulatedBank::new()),
        Sinks::all(Arc::new(TracingSink)),
    )
    .await
    .context("opening coin ledger")?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down coin ledger");

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&ledger.metrics().registry().gather(), &mut buffer)
        .context("encoding metrics")?;
    tracing::info!(metrics = %String::from_utf8_lossy(&buffer), "Final metrics");

    ledger.shutdown().await?;
    Ok(())
}
