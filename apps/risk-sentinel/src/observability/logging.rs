//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Error type for observability setup.
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    /// Invalid level or filter directive.
    #[error("invalid log filter {filter}: {message}")]
    Filter {
        /// Directive that failed to parse.
        filter: String,
        /// Parser message.
        message: String,
    },

    /// A global subscriber was already installed.
    #[error("tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),

    /// Prometheus exporter failed to start.
    #[error("metrics exporter error: {0}")]
    Metrics(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ObservabilityError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = format!("warn,risk_sentinel={}", config.level);
            EnvFilter::try_new(&directive).map_err(|e| ObservabilityError::Filter {
                filter: directive,
                message: e.to_string(),
            })?
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format.as_str() {
        "json" => builder
            .json()
            .with_current_span(config.include_spans)
            .try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };

    result.map_err(|e| ObservabilityError::AlreadyInitialized(e.to_string()))
}
