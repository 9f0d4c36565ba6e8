//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level from config, overridable through `RUST_LOG`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, ObservabilityConfig};

/// Install the global tracing subscriber.
///
/// Returns an error if a subscriber was already installed.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    }
}

fn default_directives(level: &str) -> String {
    // Dependencies log at warn at most.
    let deps = match level {
        "error" | "off" => level,
        _ => "warn",
    };
    format!("packet_server={},{}", level, deps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_keep_dependencies_quiet() {
        assert_eq!(default_directives("debug"), "packet_server=debug,warn");
        assert_eq!(default_directives("trace"), "packet_server=trace,warn");
        assert_eq!(default_directives("error"), "packet_server=error,error");
    }
}
