//! Asynchronous TCP server core for packet-based game protocols.
//!
//! A [`Server`] accepts connections, gives each one a fixed-capacity receive
//! buffer from a [`BufferPool`], and hands received bytes to a
//! [`ProtocolHandler`] built per connection by a [`HandlerFactory`]. The
//! [`codec`] module has the byte-order and string helpers handlers use to
//! decode what they receive.

pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use error::ServerError;
pub use lifecycle::Shutdown;
pub use net::{
    BufferPool, Connection, ConnectionId, HandlerFactory, ProtocolHandler, ReceiveBuffer, Server,
};
