//! Compiler configuration.
//!
//! ```rust
//! use ternc::config::CompilerConfig;
//! use tern_abi::TableVersion;
//!
//! let config = CompilerConfig::builder()
//!     .exchange_capacity(8192)
//!     .table_version(TableVersion::V1)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.exchange_capacity, 8192);
//! ```

use tern_abi::TableVersion;
use thiserror::Error;

/// Size of one linear-memory page in bytes.
pub const PAGE_SIZE: u32 = 65_536;

/// Smallest exchange buffer that can hold a request with no arguments.
pub const MIN_EXCHANGE_CAPACITY: u32 = tern_abi::wire::REQUEST_HEADER_LEN as u32;

/// Configuration for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Size of the host exchange buffer at offset 0 of linear memory.
    /// Default: 4096 bytes.
    pub exchange_capacity: u32,

    /// Size of the argument scratch area that follows the exchange buffer.
    /// Bounds the number of i32 arguments a request can carry to the host.
    /// Default: 1024 bytes.
    pub scratch_capacity: u32,

    /// Encoding of the embedded effect table.
    /// Default: version 2.
    pub table_version: TableVersion,

    /// Call tail clauses of a statically enclosing handler directly.
    /// Default: true.
    pub direct_tail_calls: bool,

    /// Treat a package-visible effect without an explicit id as an error
    /// instead of a warning.
    /// Default: false.
    pub strict_effect_ids: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            exchange_capacity: 4096,
            scratch_capacity: 1024,
            table_version: TableVersion::V2,
            direct_tail_calls: true,
            strict_effect_ids: false,
        }
    }
}

impl CompilerConfig {
    pub fn builder() -> CompilerConfigBuilder {
        CompilerConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_capacity < MIN_EXCHANGE_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "exchange_capacity",
                message: format!("must be at least {MIN_EXCHANGE_CAPACITY} bytes"),
            });
        }
        if self.exchange_capacity % 4 != 0 || self.scratch_capacity % 4 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "exchange_capacity",
                message: "buffer sizes must be multiples of 4".into(),
            });
        }
        if self.scratch_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scratch_capacity",
                message: "must be at least 4 bytes".into(),
            });
        }
        Ok(())
    }

    /// Byte offset of the argument scratch area.
    pub fn scratch_offset(&self) -> u32 {
        self.exchange_capacity
    }

    /// Maximum number of arguments a host-bound request can carry.
    pub fn max_host_args(&self) -> u32 {
        self.scratch_capacity / 4
    }

    /// Linear memory size in pages.
    pub fn memory_pages(&self) -> u64 {
        let bytes = u64::from(self.exchange_capacity) + u64::from(self.scratch_capacity);
        bytes.div_ceil(u64::from(PAGE_SIZE)).max(1)
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Builder for CompilerConfig.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfigBuilder {
    config: CompilerConfig,
}

impl CompilerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange_capacity(mut self, bytes: u32) -> Self {
        self.config.exchange_capacity = bytes;
        self
    }

    pub fn scratch_capacity(mut self, bytes: u32) -> Self {
        self.config.scratch_capacity = bytes;
        self
    }

    pub fn table_version(mut self, version: TableVersion) -> Self {
        self.config.table_version = version;
        self
    }

    pub fn direct_tail_calls(mut self, enabled: bool) -> Self {
        self.config.direct_tail_calls = enabled;
        self
    }

    pub fn strict_effect_ids(mut self, strict: bool) -> Self {
        self.config.strict_effect_ids = strict;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<CompilerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
