//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Count server activity per instance (connections, bytes, packets, faults)
//! - Mirror every update to the `metrics` facade for Prometheus scraping
//! - Log periodic snapshots until shutdown
//!
//! # Metrics
//! - `packet_server_connections_accepted_total` (counter)
//! - `packet_server_connections_closed_total` (counter)
//! - `packet_server_active_connections` (gauge)
//! - `packet_server_accept_errors_total` (counter)
//! - `packet_server_backpressure_drops_total` (counter)
//! - `packet_server_handler_panics_total` (counter)
//! - `packet_server_bytes_total` (counter, `direction` = in|out)
//! - `packet_server_packets_total` (counter, `direction` = in|out)
//!
//! # Design Decisions
//! - Counters live on the server instance, so independent servers in one
//!   process (tests) do not share state
//! - Low-overhead metric updates (relaxed atomics)

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Install the Prometheus exporter on `addr`.
///
/// Must be called from within a tokio runtime. Failures are logged; the server
/// runs without an exporter.
pub fn init_metrics(addr: SocketAddr) {
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Atomic activity counters for one server instance.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    accept_errors: AtomicU64,
    backpressure_drops: AtomicU64,
    handler_panics: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub accept_errors: u64,
    pub backpressure_drops: u64,
    pub handler_panics: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_connections_accepted_total").increment(1);
        metrics::gauge!("packet_server_active_connections").increment(1.0);
    }

    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_connections_closed_total").increment(1);
        metrics::gauge!("packet_server_active_connections").decrement(1.0);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_accept_errors_total").increment(1);
    }

    pub fn record_backpressure_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_backpressure_drops_total").increment(1);
    }

    pub fn record_handler_panic(&self, hook: &'static str) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_handler_panics_total", "hook" => hook).increment(1);
    }

    /// One completed read of `bytes` bytes.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_bytes_total", "direction" => "in").increment(bytes as u64);
        metrics::counter!("packet_server_packets_total", "direction" => "in").increment(1);
    }

    /// One completed write of `bytes` bytes.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("packet_server_bytes_total", "direction" => "out").increment(bytes as u64);
        metrics::counter!("packet_server_packets_total", "direction" => "out").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let accepted = self.connections_accepted.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_accepted: accepted,
            connections_closed: closed,
            active_connections: accepted.saturating_sub(closed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
        }
    }
}

/// Periodically logs a metrics snapshot until shutdown is signalled.
pub struct StatsReporter {
    metrics: Arc<ServerMetrics>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(metrics: Arc<ServerMetrics>, interval: Duration) -> Self {
        Self { metrics, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.interval.is_zero() {
            tracing::debug!("Stats reporter disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so the first line has data.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = self.metrics.snapshot();
                    tracing::info!(
                        active = s.active_connections,
                        accepted = s.connections_accepted,
                        closed = s.connections_closed,
                        bytes_in = s.bytes_in,
                        bytes_out = s.bytes_out,
                        backpressure_drops = s.backpressure_drops,
                        "Server stats"
                    );
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Stats reporter received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_activity() {
        let m = ServerMetrics::new();
        m.record_accepted();
        m.record_accepted();
        m.record_closed();
        m.record_received(100);
        m.record_received(28);
        m.record_sent(64);
        m.record_backpressure_drop();

        let s = m.snapshot();
        assert_eq!(s.connections_accepted, 2);
        assert_eq!(s.active_connections, 1);
        assert_eq!(s.bytes_in, 128);
        assert_eq!(s.packets_in, 2);
        assert_eq!(s.bytes_out, 64);
        assert_eq!(s.packets_out, 1);
        assert_eq!(s.backpressure_drops, 1);
    }

    #[test]
    fn instances_are_independent() {
        let a = ServerMetrics::new();
        let b = ServerMetrics::new();
        a.record_accepted();
        assert_eq!(b.snapshot().connections_accepted, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(ServerMetrics::new().snapshot()).unwrap();
        assert_eq!(json["bytes_in"], 0);
    }

    #[tokio::test]
    async fn reporter_exits_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let reporter = StatsReporter::new(Arc::new(ServerMetrics::new()), Duration::from_millis(10));
        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }
}
