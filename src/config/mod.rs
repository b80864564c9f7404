//! Configuration loading and validation.
//!
//! A configuration file holds a `[logger]` table and a `[connection]` table:
//!
//! ```toml
//! [logger]
//! level = "debug"
//!
//! [connection]
//! keepAlive = 30
//! caFile = "/etc/mqtt/ca.crt"
//! ```
//!
//! Loading is done once, before connecting; the result is not meant to be
//! mutated afterwards.

use std::{fs, path::Path};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

pub mod connection;
pub mod logger;

pub use connection::ConnectConfig;
pub use logger::LoggerConfig;

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration file.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub connection: ConnectConfig,
}

impl Config {
    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        load_file(path)
    }

    pub fn from_toml_str(contents: &str) -> Result<Config, ConfigError> {
        parse(contents)
    }
}

impl ConnectConfig {
    /// Loads a file holding only connection options, without a table header.
    pub fn load(path: &Path) -> Result<ConnectConfig, ConfigError> {
        load_file(path)
    }

    pub fn from_toml_str(contents: &str) -> Result<ConnectConfig, ConfigError> {
        parse(contents)
    }
}

fn load_file<T: DeserializeOwned + Validate>(path: &Path) -> Result<T, ConfigError> {
    info!("Loading configuration from: {}", path.display());

    if !path.exists() {
        return Err(ConfigError::Config(format!(
            "{} does not exist",
            path.display()
        )));
    }

    let contents = fs::read_to_string(path)?;
    let config = parse(&contents)?;

    debug!("Loaded configuration from: {}", path.display());
    Ok(config)
}

fn parse<T: DeserializeOwned + Validate>(contents: &str) -> Result<T, ConfigError> {
    let config: T =
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

    Ok(config)
}
