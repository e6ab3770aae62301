//! Tracing setup.
//!
//! Structured logging via `tracing` and `tracing-subscriber`:
//! - Environment-based filtering (`RUST_LOG` wins over the configured level)
//! - Pretty, compact or JSON output
//! - Idempotent initialisation, so tests and embedders can call it freely
//!
//! # Example
//! ```no_run
//! use lsi_correlator::{config::Settings, logging};
//!
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(address = %settings.instrument.endpoint(), "Driver starting");
//! # Ok::<(), lsi_correlator::error::CorrelatorError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Settings;
use crate::error::{CorrelatorError, CorrelatorResult};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// One line per event, no colours (services)
    Compact,
    /// Newline-delimited JSON (log aggregation)
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> CorrelatorResult<Self> {
        match format.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(CorrelatorError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                format
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging options for `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Derive options from the `[application]` section.
    pub fn from_settings(settings: &Settings) -> CorrelatorResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: OutputFormat::parse(&settings.application.log_format)?,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colours
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise logging from loaded settings.
pub fn init_from_settings(settings: &Settings) -> CorrelatorResult<()> {
    init(LoggingConfig::from_settings(settings)?)
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber.
///
/// Calling this again after a subscriber is installed returns `Ok(())`.
pub fn init(config: LoggingConfig) -> CorrelatorResult<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Already initialised by a test harness or an embedding application.
        Err(e) if is_already_set(&e.to_string()) => Ok(()),
        Err(e) => {
            INSTALLED.store(false, Ordering::SeqCst);
            Err(CorrelatorError::Configuration(format!(
                "Failed to initialize tracing: {}",
                e
            )))
        }
    }
}

fn is_already_set(message: &str) -> bool {
    message.contains("global default trace dispatcher")
        || message.contains("logging system was already initialized")
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> CorrelatorResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(CorrelatorError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.application.log_level = "debug".into();
        settings.application.log_format = "json".into();

        let config = LoggingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
