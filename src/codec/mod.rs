//! Byte-level helpers for protocol handlers.
//!
//! # Responsibilities
//! - Read fixed-width integers in network order or the "low" (little-endian) order
//! - Read and write length-prefixed and null-terminated strings
//! - Build outbound packets, including back-patched length prefixes
//! - Compute the summing checksum used by legacy clients
//!
//! Nothing here touches sockets; handlers run these over `ReceiveBuffer::filled()`
//! and hand the frozen output to `Connection::send`.

pub mod checksum;
pub mod packet_in;
pub mod packet_out;

pub use packet_in::PacketIn;
pub use packet_out::{LengthMarker, PacketOut};

use thiserror::Error;

/// Errors raised while decoding or encoding packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A read needed more bytes than the packet has left.
    #[error("Unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A back-patched length prefix cannot hold the body length.
    #[error("Length {len} does not fit in a {width}-byte prefix")]
    LengthOverflow { len: usize, width: usize },

    /// A length marker points outside the packet.
    #[error("Length marker at offset {offset} is outside the packet")]
    InvalidMarker { offset: usize },
}
