//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (backlog > 0, buffer sizes sane)
//! - Check addresses parse before the server tries to bind them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::{PoolStrategy, ServerConfig};

/// Largest receive buffer accepted by validation.
pub const MAX_RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let listener = &config.listener;

    if listener.bind_ip.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_ip",
            format!("'{}' is not an IP address", listener.bind_ip),
        ));
    }
    if listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be greater than 0"));
    }
    if listener.send_buffer_size == 0 {
        errors.push(ValidationError::new(
            "listener.send_buffer_size",
            "must be greater than 0",
        ));
    }
    if listener.receive_buffer_size == 0 || listener.receive_buffer_size > MAX_RECEIVE_BUFFER_SIZE {
        errors.push(ValidationError::new(
            "listener.receive_buffer_size",
            format!("must be between 1 and {} bytes", MAX_RECEIVE_BUFFER_SIZE),
        ));
    }
    if let Some(region_ip) = &listener.region_ip {
        if region_ip.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "listener.region_ip",
                format!("'{}' is not an IP address", region_ip),
            ));
        }
    }

    if config.buffer_pool.strategy == PoolStrategy::FreeList && config.buffer_pool.max_free == 0 {
        errors.push(ValidationError::new(
            "buffer_pool.max_free",
            "must be greater than 0 with the free_list strategy",
        ));
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
