//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → handed to Server::new, read-only afterwards
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the bind address cannot change under a live listener
//! - Every section and field defaults, so an empty file is a valid config
//! - serde rejects malformed input; validation.rs reports every semantic problem at once

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::BufferPoolConfig;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
pub use schema::ServerConfig;
pub use schema::ShutdownConfig;
