//! Host Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TERN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TERN_EXCHANGE_CAPACITY` | Exchange buffer size in bytes; must match the artifact | 4096 |
//! | `TERN_MAX_REQUESTS` | Effect requests allowed per run (0 = unlimited) | 0 |
//! | `TERN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use tern_host::config::{HostConfig, LogLevel};
//!
//! let config = HostConfig::builder()
//!     .exchange_capacity(8192)
//!     .max_requests(Some(1_000))
//!     .log_level(LogLevel::Debug)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.exchange_capacity, 8192);
//! ```

use std::env;

use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Smallest exchange buffer that can hold a request with no arguments.
pub const MIN_EXCHANGE_CAPACITY: usize = tern_abi::wire::REQUEST_HEADER_LEN;

/// Log level for host logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a log level name or number.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// The `tracing` filter an embedder installs for this level.
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Configuration of a [`HostRuntime`](crate::HostRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Size of the exchange buffer at offset 0 of the artifact's memory.
    /// Must equal the capacity the artifact was compiled with.
    /// Default: 4096 bytes.
    pub exchange_capacity: usize,

    /// Maximum number of effect requests one run may issue.
    /// `None` means unlimited (default).
    pub max_requests: Option<usize>,

    /// Suggested log level for embedders that install a subscriber.
    /// The library itself never installs one.
    /// Default: Info.
    pub log_level: LogLevel,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            exchange_capacity: 4096,
            max_requests: None,
            log_level: LogLevel::Info,
        }
    }
}

impl HostConfig {
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. A variable that is set but does
    /// not parse is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("TERN_EXCHANGE_CAPACITY")? {
            config.exchange_capacity = val;
        }

        if let Some(val) = parse_env_usize("TERN_MAX_REQUESTS")? {
            config.max_requests = (val > 0).then_some(val);
        }

        if let Ok(val) = env::var("TERN_LOG_LEVEL") {
            config.log_level = LogLevel::parse(&val).ok_or_else(|| ConfigError::EnvParse {
                var: "TERN_LOG_LEVEL".into(),
                message: format!("unknown log level `{val}`"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_capacity < MIN_EXCHANGE_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "exchange_capacity".into(),
                message: format!("must be at least {MIN_EXCHANGE_CAPACITY} bytes"),
            });
        }

        if self.exchange_capacity % 4 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "exchange_capacity".into(),
                message: "must be a multiple of 4".into(),
            });
        }

        if self.max_requests == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_requests".into(),
                message: "must be at least 1; use None for unlimited".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse { var: String, message: String },
}

/// Builder for [`HostConfig`].
#[derive(Debug, Clone, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the exchange buffer size in bytes.
    pub fn exchange_capacity(mut self, bytes: usize) -> Self {
        self.config.exchange_capacity = bytes;
        self
    }

    /// Limit the number of effect requests per run.
    pub fn max_requests(mut self, limit: Option<usize>) -> Self {
        self.config.max_requests = limit;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<HostConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(s) => s.trim().parse().map(Some).map_err(|e| ConfigError::EnvParse {
            var: name.into(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.exchange_capacity, 4096);
        assert_eq!(config.max_requests, None);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = HostConfig::builder()
            .exchange_capacity(256)
            .max_requests(Some(8))
            .log_level(LogLevel::Trace)
            .build()
            .unwrap();

        assert_eq!(config.exchange_capacity, 256);
        assert_eq!(config.max_requests, Some(8));
        assert_eq!(config.log_level.to_level_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn test_builder_validation() {
        assert!(HostConfig::builder().exchange_capacity(16).build().is_err());
        assert!(HostConfig::builder().exchange_capacity(4098).build().is_err());
        assert!(HostConfig::builder().max_requests(Some(0)).build().is_err());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("Debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::Warn.as_str(), "warn");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "exchange_capacity".into(),
            message: "must be a multiple of 4".into(),
        };
        assert!(err.to_string().contains("exchange_capacity"));
        assert!(err.to_string().contains("multiple of 4"));
    }

    // Environment variables are process-global, so every from_env case runs
    // in this one test.
    #[test]
    fn test_from_env() {
        env::remove_var("TERN_EXCHANGE_CAPACITY");
        env::remove_var("TERN_MAX_REQUESTS");
        env::remove_var("TERN_LOG_LEVEL");
        assert_eq!(HostConfig::from_env().unwrap(), HostConfig::default());

        env::set_var("TERN_EXCHANGE_CAPACITY", "1024");
        env::set_var("TERN_MAX_REQUESTS", "0");
        env::set_var("TERN_LOG_LEVEL", "debug");
        let config = HostConfig::from_env().unwrap();
        assert_eq!(config.exchange_capacity, 1024);
        assert_eq!(config.max_requests, None);
        assert_eq!(config.log_level, LogLevel::Debug);

        env::set_var("TERN_MAX_REQUESTS", "many");
        let err = HostConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvParse { ref var, .. } if var == "TERN_MAX_REQUESTS"));

        env::remove_var("TERN_EXCHANGE_CAPACITY");
        env::remove_var("TERN_MAX_REQUESTS");
        env::remove_var("TERN_LOG_LEVEL");
    }
}
