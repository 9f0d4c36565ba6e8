//! TCP server: listening socket, accept loop, and teardown authority.
//!
//! # Responsibilities
//! - Bind the configured address and listen with the configured backlog
//! - Accept connections, configure them, and register them
//! - Remove connections exactly once, however many parties ask
//! - Stop: close the listener, sever every connection, wait for the hooks
//!
//! # Design Decisions
//! - The listening socket lives in a slot (`Idle` / `Bound` / `Listening`)
//!   behind one mutex, so `start` and `stop` never race on it
//! - The accept loop holds only a weak reference to the server; dropping the
//!   last `Arc<Server>` ends it
//! - `init_socket` and `start` report `bool` and log the reason; everything
//!   below them propagates `ServerError`
//! - Setting up one accepted socket runs user code (factory, buffer pool);
//!   a panic there costs that socket only, never the accept loop
//! - `stop` waits on one shared deadline, including for connections another
//!   caller already disconnected

use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::buffer_pool::{build_pool, BufferPool, PacketBuffer, PoolStats};
use crate::net::connection::{panic_message, Connection, ConnectionId};
use crate::net::handler::{DiscardFactory, HandlerFactory};
use crate::net::registry::Registry;
use crate::observability::metrics::{MetricsSnapshot, ServerMetrics};
use crate::observability::spans;

/// Pause before re-arming accept after an error that suggests resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct AcceptLoop {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum ListenerSlot {
    Idle,
    Bound { socket: TcpSocket, addr: SocketAddr },
    Listening(AcceptLoop),
}

/// A TCP server hosting many concurrent connections.
pub struct Server {
    config: ServerConfig,
    slot: Mutex<ListenerSlot>,
    registry: Registry<Arc<Connection>>,
    pool: Arc<dyn BufferPool>,
    factory: Arc<dyn HandlerFactory>,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.config.listener.bind_address())
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Server whose connections discard everything they receive.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_factory(config, DiscardFactory)
    }

    /// Server building a handler per connection with `factory`.
    pub fn with_factory(config: ServerConfig, factory: impl HandlerFactory) -> Arc<Self> {
        let pool = build_pool(&config.buffer_pool, config.listener.receive_buffer_size);
        Self::with_parts(config, Arc::new(factory), pool)
    }

    /// Server with an explicit buffer pool strategy.
    pub fn with_parts(
        config: ServerConfig,
        factory: Arc<dyn HandlerFactory>,
        pool: Arc<dyn BufferPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot: Mutex::new(ListenerSlot::Idle),
            registry: Registry::new(),
            pool,
            factory,
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, ListenerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and bind the listening socket without listening on it.
    ///
    /// Returns `false` (after logging why) if the address is invalid or
    /// cannot be bound. Calling it again while bound is a no-op.
    pub fn init_socket(&self) -> bool {
        let mut slot = self.lock_slot();
        match Self::ensure_bound(&self.config, &mut slot) {
            Ok(addr) => {
                tracing::debug!(address = %addr, "Socket bound");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialize socket");
                false
            }
        }
    }

    fn ensure_bound(config: &ServerConfig, slot: &mut ListenerSlot) -> Result<SocketAddr, ServerError> {
        match slot {
            ListenerSlot::Bound { addr, .. } => return Ok(*addr),
            ListenerSlot::Listening(accept) => return Err(ServerError::AlreadyListening(accept.local_addr)),
            ListenerSlot::Idle => {}
        }

        let listener = &config.listener;
        let ip: IpAddr = listener
            .bind_ip
            .parse()
            .map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
                address: listener.bind_address(),
                reason: e.to_string(),
            })?;
        let requested = SocketAddr::new(ip, listener.port);

        let bind_err = |source: std::io::Error| ServerError::Bind { addr: requested, source };
        let socket = match requested {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_err)?;
        // Windows lets SO_REUSEADDR steal a port that is in use.
        #[cfg(not(windows))]
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(requested).map_err(bind_err)?;
        let addr = socket.local_addr().map_err(bind_err)?;

        *slot = ListenerSlot::Bound { socket, addr };
        Ok(addr)
    }

    /// Listen and start accepting connections.
    ///
    /// Returns immediately. Returns `false` if the socket cannot be bound or
    /// put into the listening state, or if the server is already listening.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        match self.try_start() {
            Ok(addr) => {
                tracing::info!(
                    address = %addr,
                    backlog = self.config.listener.backlog,
                    buffer_size = self.pool.buffer_size(),
                    "Server listening"
                );
                true
            }
            Err(e @ ServerError::AlreadyListening(_)) => {
                tracing::warn!(error = %e, "Ignoring start request");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start server");
                false
            }
        }
    }

    fn try_start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let mut slot = self.lock_slot();
        let addr = Self::ensure_bound(&self.config, &mut slot)?;

        let ListenerSlot::Bound { socket, .. } = std::mem::replace(&mut *slot, ListenerSlot::Idle) else {
            return Err(ServerError::NotListening);
        };
        // On failure the socket is dropped here and the slot stays idle.
        let listener = socket
            .listen(self.config.listener.backlog)
            .map_err(|source| ServerError::Listen { addr, source })?;

        self.registry.open();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(
            accept_loop(Arc::downgrade(self), listener, stop_rx).instrument(spans::accept_span(addr)),
        );
        *slot = ListenerSlot::Listening(AcceptLoop {
            local_addr: addr,
            stop,
            task,
        });
        Ok(addr)
    }

    /// Stop listening and sever every connection.
    ///
    /// When this returns, the listening socket is closed, the registry is
    /// empty, and every connection that was registered or still tearing down
    /// has run `on_disconnect`, or had its tasks aborted when
    /// `shutdown.drain_timeout_ms` ran out. The timeout bounds the whole
    /// drain, not each connection. Calling it on a stopped server does nothing.
    pub async fn stop(&self) {
        let previous = {
            let mut slot = self.lock_slot();
            std::mem::replace(&mut *slot, ListenerSlot::Idle)
        };
        match previous {
            ListenerSlot::Listening(accept) => {
                accept.stop.send_replace(true);
                if let Err(e) = accept.task.await {
                    tracing::error!(error = %e, "Accept loop failed");
                }
                tracing::info!(address = %accept.local_addr, "Listener closed");
            }
            ListenerSlot::Bound { addr, .. } => {
                tracing::debug!(address = %addr, "Released bound socket");
            }
            ListenerSlot::Idle => {}
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown.drain_timeout_ms);
        let drained = self.registry.close_and_drain();
        // Disconnected before the drain, hooks possibly still running.
        let retiring = self.registry.retiring();
        if drained.is_empty() && retiring.is_empty() {
            return;
        }
        tracing::info!(connections = drained.len(), retiring = retiring.len(), "Closing connections");
        for conn in &drained {
            conn.begin_teardown();
            self.metrics.record_closed();
            conn.close_connections();
        }

        for conn in drained.iter().chain(&retiring) {
            conn.join(deadline).await;
        }
        tracing::info!("All connections closed");
    }

    /// Tear `conn` down. The single teardown entry point.
    ///
    /// Returns `true` for exactly one caller per connection; later and
    /// concurrent callers get `false`.
    pub fn disconnect(&self, conn: &Arc<Connection>) -> bool {
        if self.registry.retire(conn.id()).is_none() {
            return false;
        }

        conn.begin_teardown();
        self.metrics.record_closed();
        conn.close_connections();
        tracing::info!(
            connection_id = %conn.id(),
            peer_addr = %conn.peer_addr(),
            remaining = self.registry.len(),
            "Client disconnected"
        );
        true
    }

    /// Both I/O tasks of `id` have exited.
    pub(crate) fn teardown_finished(&self, id: ConnectionId) {
        self.registry.forget(id);
    }

    fn handle_accepted(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.configure_stream(&stream) {
            tracing::warn!(peer_addr = %peer_addr, error = %e, "Dropping accepted socket");
            self.metrics.record_accept_error();
            return;
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(peer_addr = %peer_addr, error = %e, "Accepted socket has no local address");
                self.metrics.record_accept_error();
                return;
            }
        };

        let handler = match catch_unwind(AssertUnwindSafe(|| self.factory.new_handler(peer_addr))) {
            Ok(handler) => handler,
            Err(_) => {
                tracing::error!(peer_addr = %peer_addr, "Handler factory panicked");
                self.metrics.record_handler_panic("new_handler");
                return;
            }
        };

        let conn = Connection::new(
            self.registry.next_id(),
            peer_addr,
            local_addr,
            Arc::downgrade(self),
            Arc::clone(&self.pool),
            Arc::clone(&self.metrics),
        );
        // Torn down on every early return or unwind until launched.
        let mut pending = PendingConnection {
            server: self,
            conn: Some(Arc::clone(&conn)),
        };
        if let Err(e) = self.registry.insert(conn.id(), Arc::clone(&conn)) {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Refusing connection");
            return;
        }

        self.metrics.record_accepted();
        tracing::info!(
            connection_id = %conn.id(),
            peer_addr = %peer_addr,
            clients = self.registry.len(),
            "Client connected"
        );
        conn.launch(stream, handler);
        pending.conn = None;
    }

    fn configure_stream(&self, stream: &TcpStream) -> Result<(), ServerError> {
        let listener = &self.config.listener;
        stream
            .set_nodelay(listener.no_delay)
            .map_err(|source| ServerError::SocketOption { option: "TCP_NODELAY", source })?;
        socket2::SockRef::from(stream)
            .set_send_buffer_size(listener.send_buffer_size)
            .map_err(|source| ServerError::SocketOption { option: "SO_SNDBUF", source })?;
        Ok(())
    }

    /// Number of registered connections.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the registered connections.
    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    pub fn find_client(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Address the listening socket is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_slot() {
            ListenerSlot::Idle => None,
            ListenerSlot::Bound { addr, .. } => Some(*addr),
            ListenerSlot::Listening(accept) => Some(accept.local_addr),
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(&*self.lock_slot(), ListenerSlot::Listening(_))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared handle to the live counters, for reporters.
    pub fn metrics_handle(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn acquire_packet_buffer(&self) -> PacketBuffer {
        self.pool.acquire()
    }

    pub fn release_packet_buffer(&self, buffer: PacketBuffer) {
        self.pool.release(buffer);
    }
}

struct PendingConnection<'a> {
    server: &'a Server,
    conn: Option<Arc<Connection>>,
}

impl Drop for PendingConnection<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !self.server.disconnect(&conn) {
            conn.close_connections();
        }
        // No I/O task will report back for it.
        self.server.teardown_finished(conn.id());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        let slot = std::mem::replace(slot, ListenerSlot::Idle);
        if let ListenerSlot::Listening(accept) = slot {
            accept.stop.send_replace(true);
            accept.task.abort();
        }
        for conn in self.registry.close_and_drain() {
            conn.begin_teardown();
            conn.close_connections();
        }
    }
}

async fn accept_loop(server: Weak<Server>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };

        let Some(server) = server.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if *stop.borrow() {
                    drop(stream);
                    break;
                }
                let setup = catch_unwind(AssertUnwindSafe(|| server.handle_accepted(stream, peer_addr)));
                if let Err(payload) = setup {
                    tracing::error!(
                        peer_addr = %peer_addr,
                        panic = %panic_message(payload.as_ref()),
                        "Connection setup panicked, dropping socket"
                    );
                    server.metrics.record_accept_error();
                }
            }
            Err(e) => {
                server.metrics.record_accept_error();
                tracing::warn!(error = %e, "Accept failed");
                drop(server);
                if needs_backoff(&e) {
                    tokio::select! {
                        biased;
                        _ = stop.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
    }
    tracing::debug!("Accept loop exited");
}

/// Accept errors caused by one aborted handshake are retried immediately;
/// anything else (descriptor or memory exhaustion) waits a moment first.
fn needs_backoff(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    !matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}
