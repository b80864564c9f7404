//! Logging initialization.
//!
//! The crate itself only emits `tracing` events; binaries and demos call
//! [`LoggerManager::init`] once at startup to install a console subscriber.
//!
//! ```ignore
//! let mut logger = LoggerManager::new(config.logger.clone())?;
//! logger.init()?;
//! ```

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, fmt::writer::BoxMakeWriter, prelude::*, EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::config::logger::{ConsoleConfig, LogFormat, LogStream, LoggerConfig};

/// Errors that can occur during logger configuration or initialization.
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// A global subscriber is already installed.
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    /// Console output is disabled and there is nothing else to log to.
    #[error("No logging layers were configured")]
    NoLayersConfigured,
}

/// Validates logging configuration and installs the global subscriber.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if configuration validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Installs the global `tracing` subscriber. Call once at startup.
    ///
    /// # Errors
    ///
    /// Fails if console output is disabled or a global subscriber is
    /// already set.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        if !self.config.console.enabled {
            return Err(LoggerError::NoLayersConfigured);
        }

        let layer = self.console_layer(&self.config.console, self.filter());
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(
        &self,
        config: &ConsoleConfig,
        filter: EnvFilter,
    ) -> Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> {
        let writer = match config.stream {
            LogStream::Stdout => BoxMakeWriter::new(io::stdout),
            LogStream::Stderr => BoxMakeWriter::new(io::stderr),
        };
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(writer);

        match config.format {
            LogFormat::Json => layer.json().with_filter(filter).boxed(),
            LogFormat::Pretty => layer.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => layer.compact().with_filter(filter).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected_up_front() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..LoggerConfig::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_disabled_console_has_no_layers() {
        let mut config = LoggerConfig::default();
        config.console.enabled = false;

        let mut manager = LoggerManager::new(config).unwrap();
        assert!(matches!(
            manager.init(),
            Err(LoggerError::NoLayersConfigured)
        ));
    }
}
