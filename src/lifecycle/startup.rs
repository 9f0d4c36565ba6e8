//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration (or fall back to defaults)
//! - Initialize logging, then the metrics exporter
//! - Start the server and its stats reporter
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener starts last (traffic only when ready)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{load_config, ConfigError, ObservabilityConfig, ServerConfig};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::handler::HandlerFactory;
use crate::net::listener::Server;
use crate::observability::logging::init_logging;
use crate::observability::metrics::{init_metrics, StatsReporter};

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to initialize logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("Invalid metrics address {address}: {source}")]
    MetricsAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("Server failed to start on {address}")]
    Start { address: String },
}

/// Load the configuration file, or use defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<ServerConfig, StartupError> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(ServerConfig::default()),
    }
}

/// Install the log subscriber, then the Prometheus exporter if enabled.
///
/// Must be called from within a tokio runtime when metrics are enabled.
pub fn init_observability(config: &ObservabilityConfig) -> Result<(), StartupError> {
    let metrics_addr = metrics_address(config)?;
    init_logging(config)?;
    if let Some(addr) = metrics_addr {
        init_metrics(addr);
    }
    Ok(())
}

fn metrics_address(config: &ObservabilityConfig) -> Result<Option<SocketAddr>, StartupError> {
    if !config.metrics_enabled {
        return Ok(None);
    }
    config
        .metrics_address
        .parse()
        .map(Some)
        .map_err(|source| StartupError::MetricsAddress {
            address: config.metrics_address.clone(),
            source,
        })
}

/// A started server with its background helpers.
pub struct Running {
    pub server: Arc<Server>,
    pub shutdown: Shutdown,
    reporter: JoinHandle<()>,
}

impl Running {
    /// Signal the helpers, stop the server, and wait for both.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.server.stop().await;
        if let Err(e) = self.reporter.await {
            tracing::error!(error = %e, "Stats reporter failed");
        }
        tracing::info!("Shutdown complete");
    }
}

/// Build the server, start listening, and spawn the stats reporter.
pub fn launch(config: ServerConfig, factory: impl HandlerFactory) -> Result<Running, StartupError> {
    let address = config.listener.bind_address();
    let interval = Duration::from_secs(config.observability.stats_interval_secs);

    let server = Server::with_factory(config, factory);
    if !server.start() {
        return Err(StartupError::Start { address });
    }

    let shutdown = Shutdown::new();
    let reporter = tokio::spawn(StatsReporter::new(server.metrics_handle(), interval).run(shutdown.subscribe()));

    Ok(Running {
        server,
        shutdown,
        reporter,
    })
}
