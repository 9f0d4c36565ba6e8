//! Protocol handler seam.
//!
//! # Responsibilities
//! - Define the hooks a protocol layer implements (`ProtocolHandler`)
//! - Define the factory the server calls once per accepted socket (`HandlerFactory`)
//! - Give `on_receive` a bounded view of the receive buffer (`ReceiveBuffer`)
//!
//! # Design Decisions
//! - Handlers are composed into the generic `Connection`, not subclassed from it
//! - Hooks are synchronous and always run on the connection's own receive task,
//!   so they are serialized per connection and never run under the registry lock
//! - The core enforces only `0 <= cursor <= capacity`; framing is the handler's job

use std::net::SocketAddr;
use std::sync::Arc;

use crate::net::connection::Connection;

/// Lifecycle hooks for one connection.
///
/// All methods default to no-ops. A panic inside a hook is caught by the
/// connection task and turned into a disconnect.
pub trait ProtocolHandler: Send + 'static {
    /// Called once after the connection is registered, before the first read.
    fn on_connect(&mut self, _conn: &Arc<Connection>) {}

    /// Called after each completed read of `received` bytes.
    ///
    /// The new bytes are the last `received` bytes of `buffer.filled()`.
    /// Consume complete messages with [`ReceiveBuffer::consume`]; bytes left
    /// in the buffer stay there for the next call. A buffer that fills up
    /// without being consumed gets the connection dropped.
    fn on_receive(&mut self, _conn: &Arc<Connection>, _buffer: &mut ReceiveBuffer<'_>, _received: usize) {}

    /// Called exactly once, after the connection has left the registry.
    fn on_disconnect(&mut self, _conn: &Arc<Connection>) {}
}

/// Produces a handler for each accepted socket.
pub trait HandlerFactory: Send + Sync + 'static {
    fn new_handler(&self, peer_addr: SocketAddr) -> Box<dyn ProtocolHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn ProtocolHandler> + Send + Sync + 'static,
{
    fn new_handler(&self, peer_addr: SocketAddr) -> Box<dyn ProtocolHandler> {
        self(peer_addr)
    }
}

/// Handler with every hook left empty. Bytes are discarded on arrival.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl ProtocolHandler for DiscardHandler {
    fn on_receive(&mut self, _conn: &Arc<Connection>, buffer: &mut ReceiveBuffer<'_>, _received: usize) {
        buffer.clear();
    }
}

/// Factory producing [`DiscardHandler`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFactory;

impl HandlerFactory for DiscardFactory {
    fn new_handler(&self, _peer_addr: SocketAddr) -> Box<dyn ProtocolHandler> {
        Box::new(DiscardHandler)
    }
}

/// The filled part of a connection's receive buffer, as seen by `on_receive`.
#[derive(Debug)]
pub struct ReceiveBuffer<'a> {
    buf: &'a mut [u8],
    cursor: &'a mut usize,
}

impl<'a> ReceiveBuffer<'a> {
    pub(crate) fn new(buf: &'a mut [u8], cursor: &'a mut usize) -> Self {
        debug_assert!(*cursor <= buf.len());
        Self { buf, cursor }
    }

    /// Bytes received and not yet consumed.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..*self.cursor]
    }

    /// Mutable access to the unconsumed bytes (in-place decryption and the like).
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..*self.cursor]
    }

    /// Number of unconsumed bytes (the cursor).
    pub fn len(&self) -> usize {
        *self.cursor
    }

    pub fn is_empty(&self) -> bool {
        *self.cursor == 0
    }

    /// Total buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free space left for the next read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - *self.cursor
    }

    /// Drop the first `n` bytes and slide the rest to the front.
    ///
    /// `n` is clamped to `len()`.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(*self.cursor);
        if n == 0 {
            return;
        }
        self.buf.copy_within(n..*self.cursor, 0);
        *self.cursor -= n;
    }

    /// Drop everything received so far.
    pub fn clear(&mut self) {
        *self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_slides_remaining_bytes() {
        let mut storage = *b"abcdef\0\0";
        let mut cursor = 6;
        let mut view = ReceiveBuffer::new(&mut storage, &mut cursor);

        view.consume(2);
        assert_eq!(view.filled(), b"cdef");
        assert_eq!(view.remaining(), 4);

        view.consume(100);
        assert!(view.is_empty());
        assert_eq!(cursor, 0);
    }

    #[test]
    fn clear_resets_cursor() {
        let mut storage = [1u8; 4];
        let mut cursor = 4;
        let mut view = ReceiveBuffer::new(&mut storage, &mut cursor);
        assert_eq!(view.remaining(), 0);
        view.clear();
        assert_eq!(view.remaining(), 4);
        assert_eq!(view.capacity(), 4);
    }

    #[test]
    fn closures_are_factories() {
        let factory = |_peer: SocketAddr| -> Box<dyn ProtocolHandler> { Box::new(DiscardHandler) };
        let _handler = factory.new_handler("127.0.0.1:1".parse().unwrap());
    }
}
