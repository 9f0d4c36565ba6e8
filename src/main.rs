//! Packet server binary.
//!
//! Runs the server core with an echo handler: every byte a client sends is
//! written straight back. Useful for smoke-testing socket options, buffer
//! pooling, and shutdown behavior against real clients.
//!
//! ```text
//! packet-server --config server.toml
//! packet-server --bind-ip 127.0.0.1 --port 10300 --log-level debug
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;

use packet_server::config::validation::validate_config;
use packet_server::config::ConfigError;
use packet_server::lifecycle::{self, startup};
use packet_server::{Connection, ProtocolHandler, ReceiveBuffer};

#[derive(Parser)]
#[command(name = "packet-server")]
#[command(about = "Asynchronous TCP packet server", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_ip`.
    #[arg(long)]
    bind_ip: Option<String>,

    /// Override `listener.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

/// Writes every received byte back to the sender.
struct EchoHandler;

impl ProtocolHandler for EchoHandler {
    fn on_connect(&mut self, conn: &Arc<Connection>) {
        tracing::debug!(connection_id = %conn.id(), "Echo session opened");
    }

    fn on_receive(&mut self, conn: &Arc<Connection>, buffer: &mut ReceiveBuffer<'_>, _received: usize) {
        let data = Bytes::copy_from_slice(buffer.filled());
        buffer.clear();
        if let Err(e) = conn.send(data) {
            tracing::debug!(error = %e, "Echo dropped");
        }
    }

    fn on_disconnect(&mut self, conn: &Arc<Connection>) {
        let stats = conn.stats();
        tracing::debug!(
            connection_id = %conn.id(),
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Echo session closed"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = startup::load(cli.config.as_deref())?;
    if let Some(bind_ip) = cli.bind_ip {
        config.listener.bind_ip = bind_ip;
    }
    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    startup::init_observability(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address(),
        buffer_size = config.listener.receive_buffer_size,
        "packet-server starting"
    );

    let running = startup::launch(config, |_peer: SocketAddr| -> Box<dyn ProtocolHandler> {
        Box::new(EchoHandler)
    })?;

    lifecycle::shutdown_signal().await;

    let server = Arc::clone(&running.server);
    running.shutdown().await;
    tracing::info!(metrics = %serde_json::to_string(&server.metrics())?, "Final server metrics");
    Ok(())
}
