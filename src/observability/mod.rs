// src/observability/mod.rs
//! Logging and metrics
//!
//! - **Tracing**: `tracing-subscriber` fmt layer with `EnvFilter`
//!   (`RUST_LOG` wins over `observability.log_level`), pretty or JSON output
//! - **Metrics**: `metrics` facade, exported through a Prometheus listener
//!   when `observability.metrics_addr` is configured

pub mod metrics;

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    installed.map_err(|e| {
        EngineError::ConfigError(format!("Failed to install tracing subscriber: {}", e))
    })
}

/// Install the Prometheus exporter and describe the engine's metrics
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        debug!("Metrics export disabled (no observability.metrics_addr)");
        return Ok(());
    };

    let addr: SocketAddr = addr.parse().map_err(|e| {
        EngineError::ConfigError(format!("Invalid metrics address '{}': {}", addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    self::metrics::describe_all();
    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
