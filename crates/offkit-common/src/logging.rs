//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level when no filter is given.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Custom filter directive (e.g., "offkit_proxy=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Configuration for debugging interception decisions.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            ..Default::default()
        }
    }

    /// Configuration for deployed hosts.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            filter: None,
        }
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Initialize logging with the given configuration.
///
/// `RUST_LOG` takes precedence over `config.level` when set and no explicit
/// filter was configured.
pub fn init_logging(config: LogConfig) {
    let filter = match config.filter {
        Some(ref directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string())),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string())),
    };

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_target(true))
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_log_config_verbose() {
        let config = LogConfig::verbose();
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::default().with_filter("offkit_proxy=trace");
        assert_eq!(config.filter, Some("offkit_proxy=trace".to_string()));
    }
}
