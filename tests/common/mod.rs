//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use packet_server::config::{ListenerConfig, ServerConfig, ShutdownConfig};
use packet_server::{Connection, ConnectionId, ProtocolHandler, ReceiveBuffer, Server};
use tokio::net::TcpStream;

/// Loopback, ephemeral port, short drain deadline.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        listener: ListenerConfig::ephemeral(),
        shutdown: ShutdownConfig { drain_timeout_ms: 2000 },
        ..ServerConfig::default()
    }
}

/// What a [`RecordingHandler`] does with received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Clear the buffer after every read.
    Consume,
    /// Never touch the buffer.
    Hold,
    /// Write every byte back, then clear.
    Echo,
    /// Panic on the first read.
    PanicOnReceive,
    /// Consume, and block the receive task this long in `on_disconnect`.
    SlowDisconnect(Duration),
}

/// Hook activity shared across every handler of one server.
#[derive(Debug, Default)]
pub struct Recorder {
    pub connects: AtomicUsize,
    pub receive_calls: AtomicUsize,
    pub bytes: AtomicUsize,
    disconnects: Mutex<HashMap<ConnectionId, usize>>,
}

impl Recorder {
    /// Total `on_disconnect` calls across all connections.
    pub fn disconnects(&self) -> usize {
        self.disconnects.lock().unwrap().values().sum()
    }

    /// `on_disconnect` calls seen for `id`.
    pub fn disconnects_for(&self, id: ConnectionId) -> usize {
        self.disconnects.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    /// Highest `on_disconnect` count any single connection got.
    pub fn max_disconnects_per_connection(&self) -> usize {
        self.disconnects.lock().unwrap().values().copied().max().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

pub struct RecordingHandler {
    recorder: Arc<Recorder>,
    mode: Mode,
}

impl ProtocolHandler for RecordingHandler {
    fn on_connect(&mut self, _conn: &Arc<Connection>) {
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&mut self, conn: &Arc<Connection>, buffer: &mut ReceiveBuffer<'_>, received: usize) {
        self.recorder.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.bytes.fetch_add(received, Ordering::SeqCst);
        match self.mode {
            Mode::Consume | Mode::SlowDisconnect(_) => buffer.clear(),
            Mode::Hold => {}
            Mode::Echo => {
                let _ = conn.send(buffer.filled().to_vec());
                buffer.clear();
            }
            Mode::PanicOnReceive => panic!("handler failure injected by test"),
        }
    }

    fn on_disconnect(&mut self, conn: &Arc<Connection>) {
        if let Mode::SlowDisconnect(delay) = self.mode {
            std::thread::sleep(delay);
        }
        *self.recorder.disconnects.lock().unwrap().entry(conn.id()).or_insert(0) += 1;
    }
}

/// Server whose handlers all report into one [`Recorder`].
pub fn recording_server(config: ServerConfig, mode: Mode) -> (Arc<Server>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let shared = Arc::clone(&recorder);
    let server = Server::with_factory(config, move |_peer: SocketAddr| -> Box<dyn ProtocolHandler> {
        Box::new(RecordingHandler {
            recorder: Arc::clone(&shared),
            mode,
        })
    });
    (server, recorder)
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn connect(server: &Server) -> TcpStream {
    let addr = server.local_addr().expect("server is not bound");
    TcpStream::connect(addr).await.expect("connect failed")
}

pub const WAIT: Duration = Duration::from_secs(5);
