//! Connection state machine and receive cycle.
//!
//! # Responsibilities
//! - Own one accepted socket and one receive buffer
//! - Drive the receive → `on_receive` → re-arm cycle with one read in flight
//! - Drop connections whose buffer fills up without being consumed
//! - Release the buffer and close the socket exactly once at teardown
//!
//! # State Machine
//! ```text
//! Connected → Receiving ⇄ (re-arm) → Disconnecting → Closed
//! ```
//! Teardown is triggered by a zero-byte read, an I/O error, a handler panic,
//! a full buffer, an explicit `disconnect`, or server shutdown. Whatever the
//! trigger, the server's registry decides the single winner.
//!
//! # Buffer ownership
//! The buffer lives in a slot guarded by a small mutex. The receive task
//! checks it out for each read and hook call and returns it afterwards.
//! Teardown marks the slot released and frees the buffer if it is present;
//! if the receive task holds it at that moment, the task frees it on return.
//!
//! # Outbound frames
//! Frames queued with `send` before teardown are still written: the writer
//! drains its queue for up to `CLOSE_FLUSH_TIMEOUT` before shutting the
//! socket down. Frames queued after teardown are refused.

use bytes::Bytes;
use serde::Serialize;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::ServerError;
use crate::net::buffer_pool::{BufferPool, PacketBuffer};
use crate::net::handler::{ProtocolHandler, ReceiveBuffer};
use crate::net::listener::Server;
use crate::observability::metrics::ServerMetrics;
use crate::observability::spans;

/// How long the writer keeps flushing queued frames once the connection closes.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Unique identifier for a connection within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Socket assigned and registered; no read armed yet.
    Connected = 0,
    /// A read is armed or the receive cycle is running.
    Receiving = 1,
    /// Removed from the registry; resources being released.
    Disconnecting = 2,
    /// Buffer released, socket closing. Terminal.
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Receiving,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }
}

impl ConnectionState {
    /// True while the connection may still read and send.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Receiving)
    }
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Completed reads that delivered data.
    pub reads: u64,
    /// Highest number of reads ever in flight at once. Never above 1.
    pub max_reads_in_flight: usize,
    /// Bytes currently held in the receive buffer.
    pub cursor: usize,
}

#[derive(Debug)]
struct BufferSlot {
    buffer: Option<PacketBuffer>,
    capacity: usize,
    cursor: usize,
    released: bool,
}

/// One accepted TCP connection.
///
/// Created by the server for each accepted socket and shared as
/// `Arc<Connection>` between the registry, its I/O tasks, and the handler hooks.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    server: Weak<Server>,
    pool: Arc<dyn BufferPool>,
    metrics: Arc<ServerMetrics>,
    state: AtomicU8,
    slot: Mutex<BufferSlot>,
    closed: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Bytes>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// I/O tasks that have not exited yet.
    running_tasks: AtomicUsize,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    reads: AtomicU64,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build a connection, taking a receive buffer from `pool`.
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        server: Weak<Server>,
        pool: Arc<dyn BufferPool>,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        let buffer = pool.acquire();
        let (closed, _) = watch::channel(false);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            server,
            pool,
            metrics,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            slot: Mutex::new(BufferSlot {
                capacity: buffer.capacity(),
                buffer: Some(buffer),
                cursor: 0,
                released: false,
            }),
            closed,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            running_tasks: AtomicUsize::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            reads_in_flight: AtomicUsize::new(0),
            max_reads_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_active()
    }

    /// Capacity of the receive buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.lock_slot().capacity
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            max_reads_in_flight: self.max_reads_in_flight.load(Ordering::Relaxed),
            cursor: self.lock_slot().cursor,
        }
    }

    /// Queue `data` for sending.
    ///
    /// Safe to call from handler hooks; the bytes are written by the
    /// connection's writer task in queue order. Frames queued before a
    /// `disconnect` are flushed ahead of the socket shutdown, so a final
    /// message followed by `disconnect()` reaches a peer that is reading.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), ServerError> {
        if !self.is_connected() {
            return Err(ServerError::NotConnected(self.id.as_u64()));
        }
        self.outbound
            .send(data.into())
            .map_err(|_| ServerError::NotConnected(self.id.as_u64()))
    }

    /// Ask the owning server to tear this connection down.
    ///
    /// Returns `true` if this call performed the teardown. Without a live
    /// server the resources are released directly.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        match self.server.upgrade() {
            Some(server) => server.disconnect(self),
            None => {
                tracing::debug!(connection_id = %self.id, "Owning server is gone, closing directly");
                self.close_connections()
            }
        }
    }

    /// Release the socket and the receive buffer.
    ///
    /// Called by the server during teardown. Idempotent: only the first call
    /// does anything, and it returns `true`.
    pub fn close_connections(&self) -> bool {
        let previous = ConnectionState::from(
            self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ConnectionState::Closed {
            return false;
        }

        // Wakes the receive task out of a pending read and the writer task
        // out of its queue; the writer shuts the socket down and drops it.
        self.closed.send_replace(true);

        let buffer = {
            let mut slot = self.lock_slot();
            if slot.released {
                None
            } else {
                slot.released = true;
                slot.buffer.take()
            }
        };
        if let Some(buffer) = buffer {
            self.pool.release(buffer);
        }

        tracing::debug!(connection_id = %self.id, "Connection resources released");
        true
    }

    /// Move to `Disconnecting` unless teardown already went further.
    pub(crate) fn begin_teardown(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (ConnectionState::from(s) < ConnectionState::Disconnecting)
                .then_some(ConnectionState::Disconnecting as u8)
        });
    }

    /// Spawn the receive and writer tasks for `stream`.
    pub(crate) fn launch(self: &Arc<Self>, stream: TcpStream, handler: Box<dyn ProtocolHandler>) {
        let Some(outbound_rx) = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::error!(connection_id = %self.id, "Connection launched twice");
            return;
        };

        let (reader, writer) = stream.into_split();
        let span = spans::connection_span(self.id.as_u64(), self.peer_addr);
        self.running_tasks.store(2, Ordering::Release);
        let receive = tokio::spawn(
            Arc::clone(self)
                .receive_loop(reader, handler)
                .instrument(span.clone()),
        );
        let write = tokio::spawn(Arc::clone(self).write_loop(writer, outbound_rx).instrument(span));
        self.lock_tasks().extend([receive, write]);
    }

    /// Wait for the I/O tasks to finish, aborting any still running at `deadline`.
    pub(crate) async fn join(&self, deadline: Instant) {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(connection_id = %self.id, error = %e, "Connection task failed")
                }
                Err(_) => {
                    tracing::warn!(connection_id = %self.id, "Connection task did not finish in time, aborting");
                    task.abort();
                }
            }
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, BufferSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by each I/O task as it exits; the last one tells the server
    /// this connection no longer needs waiting for.
    fn task_finished(&self) {
        if self.running_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(server) = self.server.upgrade() {
                server.teardown_finished(self.id);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut handler: Box<dyn ProtocolHandler>) {
        let mut closed = self.closed.subscribe();

        if !self.run_hook("on_connect", || handler.on_connect(&self)) {
            self.disconnect();
        }

        while let Some((mut buffer, mut cursor)) = self.begin_receive() {
            let read = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => None,
                result = reader.read(&mut buffer[cursor..]) => Some(result),
            };
            self.reads_in_flight.fetch_sub(1, Ordering::AcqRel);

            match read {
                // Torn down while the read was pending.
                None => {
                    self.return_buffer(buffer, cursor);
                    break;
                }
                Some(Ok(0)) => {
                    self.return_buffer(buffer, cursor);
                    tracing::debug!("Peer closed the connection");
                    self.disconnect();
                    break;
                }
                Some(Ok(received)) => {
                    cursor += received;
                    self.bytes_in.fetch_add(received as u64, Ordering::Relaxed);
                    self.reads.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_received(received);

                    let completed = {
                        let mut view = ReceiveBuffer::new(&mut buffer, &mut cursor);
                        self.run_hook("on_receive", || handler.on_receive(&self, &mut view, received))
                    };
                    let still_open = self.return_buffer(buffer, cursor);
                    if !completed {
                        self.disconnect();
                        break;
                    }
                    if !still_open {
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.return_buffer(buffer, cursor);
                    if is_benign_disconnect(&e) {
                        tracing::debug!(error = %e, "Connection closed by peer");
                    } else {
                        tracing::error!(error = %e, "Receive failed");
                    }
                    self.disconnect();
                    break;
                }
            }
        }

        self.run_hook("on_disconnect", || handler.on_disconnect(&self));
        tracing::debug!("Receive task finished");
        self.task_finished();
    }

    /// Arm the next read: check state and free space, then check the buffer out.
    ///
    /// A full buffer means the handler is not consuming what it receives; the
    /// connection is dropped instead of reading further.
    fn begin_receive(self: &Arc<Self>) -> Option<(PacketBuffer, usize)> {
        if !self.is_connected() {
            return None;
        }

        let mut slot = self.lock_slot();
        if slot.released {
            return None;
        }
        if slot.cursor >= slot.capacity {
            let (cursor, capacity) = (slot.cursor, slot.capacity);
            drop(slot);
            tracing::warn!(cursor, capacity, "Receive buffer full before the handler consumed it, dropping connection");
            self.metrics.record_backpressure_drop();
            self.disconnect();
            return None;
        }
        let buffer = slot.buffer.take()?;
        let cursor = slot.cursor;
        drop(slot);

        let _ = self.state.compare_exchange(
            ConnectionState::Connected as u8,
            ConnectionState::Receiving as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_reads_in_flight.fetch_max(in_flight, Ordering::Relaxed);
        Some((buffer, cursor))
    }

    /// Put the buffer back in its slot, or free it if teardown happened meanwhile.
    ///
    /// Returns `false` when the buffer was freed.
    fn return_buffer(&self, buffer: PacketBuffer, cursor: usize) -> bool {
        let mut slot = self.lock_slot();
        if slot.released {
            drop(slot);
            self.pool.release(buffer);
            return false;
        }
        slot.buffer = Some(buffer);
        slot.cursor = cursor;
        true
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
        let mut closed = self.closed.subscribe();
        let mut healthy = true;

        loop {
            let data = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                data = outbound.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };

            // A frame already being written gets the flush window to finish.
            let written = tokio::select! {
                biased;
                result = writer.write_all(&data) => Some(result),
                _ = flush_window(&mut closed) => None,
            };
            match written {
                Some(Ok(())) => self.record_written(data.len()),
                Some(Err(e)) => {
                    if is_benign_disconnect(&e) {
                        tracing::debug!(error = %e, "Send failed, peer gone");
                    } else {
                        tracing::error!(error = %e, "Send failed");
                    }
                    healthy = false;
                    self.disconnect();
                    break;
                }
                None => {
                    tracing::debug!("Frame still unsent when the flush window closed");
                    healthy = false;
                    break;
                }
            }
        }

        if healthy {
            self.flush_queued(&mut writer, &mut outbound).await;
        }
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(error = %e, "Socket shutdown failed");
        }
        drop(writer);
        tracing::debug!("Writer task finished");
        self.task_finished();
    }

    /// Write whatever was queued before the close.
    async fn flush_queued(&self, writer: &mut OwnedWriteHalf, outbound: &mut mpsc::UnboundedReceiver<Bytes>) {
        outbound.close();
        let flush = async {
            let mut frames = 0usize;
            while let Ok(data) = outbound.try_recv() {
                writer.write_all(&data).await?;
                self.record_written(data.len());
                frames += 1;
            }
            Ok::<_, std::io::Error>(frames)
        };
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(0)) => {}
            Ok(Ok(frames)) => tracing::debug!(frames, "Flushed queued frames on close"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Flush on close failed"),
            Err(_) => tracing::debug!("Queued frames not flushed before the close timeout"),
        }
    }

    fn record_written(&self, len: usize) {
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
        self.metrics.record_sent(len);
    }

    /// Run a handler hook, converting a panic into `false`.
    fn run_hook(&self, hook: &'static str, f: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(payload) => {
                tracing::error!(hook, panic = %panic_message(payload.as_ref()), "Protocol handler panicked");
                self.metrics.record_handler_panic(hook);
                false
            }
        }
    }
}

/// Resolves `CLOSE_FLUSH_TIMEOUT` after the connection is closed.
async fn flush_window(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
    tokio::time::sleep(CLOSE_FLUSH_TIMEOUT).await;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Errors that mean "the peer went away" rather than "something is broken".
fn is_benign_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer_pool::UnpooledAllocator;

    fn detached(pool: Arc<UnpooledAllocator>) -> Arc<Connection> {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Connection::new(
            ConnectionId::from_raw(1),
            addr,
            addr,
            Weak::new(),
            pool,
            Arc::new(ServerMetrics::new()),
        )
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::from_raw(42).to_string(), "conn-42");
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Receiving,
            ConnectionState::Disconnecting,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
        assert!(ConnectionState::Receiving.is_active());
        assert!(!ConnectionState::Disconnecting.is_active());
    }

    #[test]
    fn construction_acquires_a_buffer() {
        let pool = Arc::new(UnpooledAllocator::new(128));
        let conn = detached(Arc::clone(&pool));
        assert_eq!(conn.buffer_capacity(), 128);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[test]
    fn close_releases_buffer_once() {
        let pool = Arc::new(UnpooledAllocator::new(64));
        let conn = detached(Arc::clone(&pool));

        assert!(conn.close_connections());
        assert!(!conn.close_connections());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.stats().released, 1);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn disconnect_without_server_closes_directly() {
        let pool = Arc::new(UnpooledAllocator::new(64));
        let conn = detached(Arc::clone(&pool));

        assert!(conn.disconnect());
        assert!(!conn.disconnect());
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn buffer_checked_out_during_teardown_is_released_on_return() {
        let pool = Arc::new(UnpooledAllocator::new(64));
        let conn = detached(Arc::clone(&pool));

        let (buffer, cursor) = conn.begin_receive().expect("read should arm");
        assert_eq!(conn.state(), ConnectionState::Receiving);
        assert!(conn.close_connections());
        assert_eq!(pool.stats().released, 0, "buffer is still checked out");

        assert!(!conn.return_buffer(buffer, cursor));
        assert_eq!(pool.stats().released, 1);
        assert!(conn.begin_receive().is_none());
    }

    #[test]
    fn full_buffer_is_not_armed() {
        let pool = Arc::new(UnpooledAllocator::new(16));
        let conn = detached(Arc::clone(&pool));

        let (buffer, _) = conn.begin_receive().unwrap();
        conn.reads_in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(conn.return_buffer(buffer, 16));

        assert!(conn.begin_receive().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.stats().released, 1);
        assert_eq!(conn.metrics.snapshot().backpressure_drops, 1);
    }

    #[test]
    fn send_after_close_fails() {
        let conn = detached(Arc::new(UnpooledAllocator::new(8)));
        assert!(conn.send(&b"hi"[..]).is_ok());
        conn.close_connections();
        assert!(matches!(conn.send(&b"hi"[..]), Err(ServerError::NotConnected(1))));
    }

    #[test]
    fn hook_panics_are_contained() {
        let conn = detached(Arc::new(UnpooledAllocator::new(8)));
        assert!(conn.run_hook("on_receive", || {}));
        assert!(!conn.run_hook("on_receive", || panic!("handler bug")));
        assert_eq!(conn.metrics.snapshot().handler_panics, 1);
    }

    #[test]
    fn benign_error_kinds() {
        use std::io::{Error, ErrorKind};
        assert!(is_benign_disconnect(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_benign_disconnect(&Error::from(ErrorKind::PermissionDenied)));
    }
}
