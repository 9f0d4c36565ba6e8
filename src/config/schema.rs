//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::net::buffer_pool::DEFAULT_BUFFER_SIZE;

/// Root configuration for a packet server instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, socket options, buffer size).
    pub listener: ListenerConfig,

    /// Receive buffer pooling.
    pub buffer_pool: BufferPoolConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP address to bind (e.g., "0.0.0.0").
    pub bind_ip: String,

    /// TCP port to bind. 0 picks an ephemeral port.
    pub port: u16,

    /// Pending-connection backlog passed to `listen`.
    pub backlog: u32,

    /// SO_SNDBUF applied to every accepted socket.
    pub send_buffer_size: usize,

    /// Capacity of each connection's receive buffer in bytes.
    pub receive_buffer_size: usize,

    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,

    /// Auxiliary UDP port. Carried for protocol layers; the TCP core ignores it.
    pub udp_port: Option<u16>,

    /// Auxiliary region address. Carried for protocol layers.
    pub region_ip: Option<String>,

    /// Auxiliary region port. Carried for protocol layers.
    pub region_port: Option<u16>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: 10300,
            backlog: 100,
            send_buffer_size: 64 * 1024,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            no_delay: true,
            udp_port: None,
            region_ip: None,
            region_port: None,
        }
    }
}

impl ListenerConfig {
    /// Listener config bound to loopback on an ephemeral port.
    pub fn ephemeral() -> Self {
        Self {
            bind_ip: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    /// `bind_ip:port` as a string, with IPv6 addresses bracketed.
    pub fn bind_address(&self) -> String {
        if self.bind_ip.contains(':') {
            format!("[{}]:{}", self.bind_ip, self.port)
        } else {
            format!("{}:{}", self.bind_ip, self.port)
        }
    }
}

/// Which pooling strategy hands out receive buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Allocate per connection, drop at teardown.
    #[default]
    Unpooled,
    /// Keep released buffers on a bounded free list.
    FreeList,
}

/// Receive buffer pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Pool strategy.
    pub strategy: PoolStrategy,

    /// Maximum buffers retained on the free list.
    pub max_free: usize,

    /// Buffers allocated up front by the free-list strategy.
    pub prefill: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            strategy: PoolStrategy::Unpooled,
            max_free: 1024,
            prefill: 0,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Interval between periodic stats log lines. 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
            stats_interval_secs: 60,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long `stop` waits for each connection's tasks to finish, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5000,
        }
    }
}
