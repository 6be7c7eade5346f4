//! Configuration management
//!
//! Configuration is read from a TOML file. Every field has a default, so a
//! partial file (or no file at all) yields a usable configuration.
//!
//! Precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Configuration file
//! 3. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CollectionError, ConfigError, Result};
use crate::read_preference::{ReadMode, ReadPreference};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Cursor batching
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Operation tagging
    #[serde(default)]
    pub operation: OperationConfig,

    /// Default read preference for new collections
    #[serde(default)]
    pub read_preference: Option<ReadPreference>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// MongoDB connection URI
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Connect and server selection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum pool size
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Minimum pool size
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Cursor batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Batch size hint sent with `find`, `aggregate` and `getMore`
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Upper bound for per-cursor batch size overrides
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Attach a `comment` identifying each operation to its command
    #[serde(default)]
    pub attach_comment: bool,

    /// Identifier used in operation comments
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_min_pool_size() -> u32 {
    0
}

fn default_app_name() -> String {
    "mongo-collection".to_string()
}

fn default_batch_size() -> u32 {
    101
}

fn default_max_batch_size() -> u32 {
    1000
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            timeout: default_timeout(),
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
            app_name: default_app_name(),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            attach_comment: false,
            client_id: default_client_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Explicit config file. When `None`, the default path is used
    ///   if it exists, otherwise defaults are returned.
    ///
    /// # Returns
    /// * `Ok(Config)` - Parsed and validated configuration
    /// * `Err(CollectionError::Config)` - Missing explicit file, bad TOML or
    ///   invalid values
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::default_path();
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CollectionError::Config(ConfigError::InvalidFormat(e.to_string())))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mongo-collection")
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.uri.trim().is_empty() {
            return Err(invalid("connection.uri", ""));
        }
        if self.cursor.batch_size == 0 {
            return Err(invalid("cursor.batch_size", "0"));
        }
        if self.cursor.max_batch_size < self.cursor.batch_size {
            return Err(invalid(
                "cursor.max_batch_size",
                &self.cursor.max_batch_size.to_string(),
            ));
        }
        if let Some(rp) = &self.read_preference
            && rp.mode == ReadMode::Primary
            && !rp.tags.is_empty()
        {
            return Err(invalid("read_preference.tags", "tags with mode 'primary'"));
        }
        if self.connection.min_pool_size > self.connection.max_pool_size {
            return Err(invalid(
                "connection.min_pool_size",
                &self.connection.min_pool_size.to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout)
    }
}

fn invalid(field: &str, value: &str) -> CollectionError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
