//! Metrics initialization for the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Initialize the metrics system based on configuration.
///
/// When enabled, starts an HTTP server exposing `/metrics` for
/// Prometheus to scrape. When disabled this is a no-op: unregistered
/// counters in the rest of the agent degrade to no-ops.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    Ok(())
}
