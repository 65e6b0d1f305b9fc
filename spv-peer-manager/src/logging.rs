//! Logging configuration for the peer manager.
//!
//! The library only emits `tracing` events. Applications embedding it can install their own
//! subscriber, or use [`init_logging`] for formatted console output.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

/// Returned by [`init_logging`]. Keep it alive for as long as logging is wanted.
#[derive(Debug)]
pub struct LoggingGuard {
    _private: (),
}

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter. If None, `RUST_LOG` is used, falling back to INFO.
    pub level: Option<LevelFilter>,
    /// Whether to output logs to console (stderr).
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
        }
    }
}

/// Initialize console logging with the given level.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
    })
}

/// Initialize logging with the given configuration.
///
/// If console output is disabled, logging stays off (tracing macros become no-ops) and Ok
/// is returned.
///
/// # Errors
///
/// Returns an error if a global subscriber was already installed.
///
/// # Examples
///
/// ```no_run
/// use spv_peer_manager::logging::{LoggingConfig, init_logging};
/// use spv_peer_manager::LevelFilter;
///
/// let _guard = init_logging(LoggingConfig {
///     level: Some(LevelFilter::DEBUG),
///     console: true,
/// })
/// .unwrap();
/// ```
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console {
        return Ok(LoggingGuard {
            _private: (),
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _private: (),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_console_is_a_no_op() {
        let guard = init_logging(LoggingConfig {
            level: Some(LevelFilter::TRACE),
            console: false,
        });
        assert!(guard.is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        // The first call may fail too if another test installed a subscriber first.
        let _ = init_console_logging(LevelFilter::WARN);
        let second = init_console_logging(LevelFilter::WARN);
        assert!(matches!(second, Err(LoggingError::SubscriberInit(_))));
    }
}
