//! Error types for the server core.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised inside the listener and connection machinery.
///
/// The public lifecycle entry points (`Server::init_socket`, `Server::start`)
/// log these and report a plain `bool`; everything below them propagates with `?`.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured bind address could not be parsed.
    #[error("Invalid bind address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Creating or binding the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Moving a bound socket into the listening state failed.
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a server that already has a live accept loop.
    #[error("Server is already listening on {0}")]
    AlreadyListening(SocketAddr),

    /// The server is not accepting registrations (stopped or stopping).
    #[error("Server is not listening")]
    NotListening,

    /// Applying a socket option to an accepted stream failed.
    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The connection is closing or closed.
    #[error("Connection {0} is not connected")]
    NotConnected(u64),
}
