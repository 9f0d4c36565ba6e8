//! Span constructors for long-lived tasks.
//!
//! Every event logged from a connection's tasks carries `connection_id` and
//! `peer_addr` through these spans, so log lines can be correlated without
//! repeating the fields at each call site.

use std::net::SocketAddr;
use tracing::Span;

/// Span wrapping the accept loop of the listener bound to `local_addr`.
pub fn accept_span(local_addr: SocketAddr) -> Span {
    tracing::info_span!("accept", local_addr = %local_addr)
}

/// Span wrapping a connection's receive and writer tasks.
pub fn connection_span(connection_id: u64, peer_addr: SocketAddr) -> Span {
    tracing::info_span!("connection", connection_id, peer_addr = %peer_addr)
}
