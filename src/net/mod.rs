//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, socket options)
//!     → handler.rs (factory builds the protocol handler)
//!     → connection.rs (buffer from buffer_pool.rs, receive cycle, writer)
//!     → registry.rs (tracked until teardown)
//!
//! Connection States:
//!     Connected → Receiving → Disconnecting → Closed
//! ```
//!
//! # Design Decisions
//! - Fixed-capacity receive buffers; a full buffer drops the connection
//! - Every connection is tracked so shutdown can sever and await it
//! - The server is the only party that removes connections

pub mod buffer_pool;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod registry;

pub use buffer_pool::{BufferPool, FreeListPool, PacketBuffer, PoolStats, UnpooledAllocator};
pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionStats};
pub use handler::{DiscardFactory, DiscardHandler, HandlerFactory, ProtocolHandler, ReceiveBuffer};
pub use listener::Server;
