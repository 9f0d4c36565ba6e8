//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging → Metrics exporter → Start listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Notify helpers → Stop accepting → Sever connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then observability, then the listener
//! - Ordered shutdown: stop accept, sever, await hooks
//! - Shutdown has a timeout: connection tasks are aborted after the drain deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
pub use startup::{launch, Running, StartupError};
