//! Lanscope agent entry point.
//!
//! Loads configuration, starts the configured capture mode, and runs
//! until Ctrl-C. Shutdown goes through the monitor so ARP caches are
//! restored and IP forwarding is switched back off.

use std::borrow::Cow;

use anyhow::{Context, Result};
use tracing::{info, warn};

use lanscope::Monitor;
use lanscope::config::Config;

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    lanscope::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    info!("Starting lanscope agent...");
    info!("Capture mode: {}", config.mode.as_str());
    info!("Upstream resolver: {}", config.upstream_resolver);
    info!("Query log: {}", config.db_path.display());

    let mode = config.mode;
    let monitor = Monitor::new(config).context("Failed to initialize monitor")?;

    monitor
        .start_capture(mode)
        .await
        .context("Failed to start capture")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Ctrl-C received, shutting down...");

    if let Err(err) = monitor.stop_capture().await {
        warn!("Shutdown was not clean: {err}");
    }

    let status = monitor.status().await?;
    info!(
        "Shutdown complete. {} queries logged, {} devices known.",
        status.stats.total_queries, status.stats.unique_devices
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run().await
}
