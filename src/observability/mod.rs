//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listener and connection tasks produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (per-server counters, mirrored to the metrics facade)
//!     → spans.rs (spans carrying connection ids)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → MetricsSnapshot for in-process inspection and tests
//! ```
//!
//! # Design Decisions
//! - Pretty logs for terminals, JSON when shipped to an aggregator
//! - Connection id flows through every event via spans
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod spans;

pub use self::metrics::{MetricsSnapshot, ServerMetrics};
