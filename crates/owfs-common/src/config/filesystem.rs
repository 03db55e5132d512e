//! Cache and filesystem configuration structures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by `validate()` on a configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub &'static str);

/// Top-level configuration handed to the cache registry.
///
/// # Example
///
/// ```rust
/// use owfs_common::config::OwfsConfig;
///
/// let config = OwfsConfig::default();
/// assert_eq!(config.cache.max_read_attempts, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwfsConfig {
    /// Page cache configuration.
    pub cache: CacheConfig,

    /// Directory/file manager configuration.
    pub fs: FsConfig,
}

impl OwfsConfig {
    /// Creates a configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig::for_testing(),
            fs: FsConfig::for_testing(),
        }
    }

    /// Validates every nested configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.fs.validate()
    }
}

/// Page cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on re-reads of an ordinary page whose CRC keeps failing
    /// with different data each time.
    /// Default: 8
    pub max_read_attempts: usize,

    /// Read the device bitmap back after writing it during `sync()`.
    /// Default: true
    pub verify_bitmap_writeback: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_read_attempts: 8,
            verify_bitmap_writeback: true,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_read_attempts: 4,
            ..Default::default()
        }
    }

    /// Sets the maximum number of read attempts.
    #[must_use]
    pub fn with_max_read_attempts(mut self, attempts: usize) -> Self {
        self.max_read_attempts = attempts;
        self
    }

    /// Enables or disables bitmap read-back verification.
    #[must_use]
    pub fn with_bitmap_verification(mut self, enabled: bool) -> Self {
        self.verify_bitmap_writeback = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Two reads are needed to tell a stable bad page from a glitch.
        if self.max_read_attempts < 2 {
            return Err(ConfigError("max_read_attempts must be >= 2"));
        }
        Ok(())
    }
}

/// Directory/file manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// How many times `open()` retries path resolution after a transport
    /// error.
    /// Default: 3
    pub open_attempts: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self { open_attempts: 3 }
    }
}

impl FsConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self { open_attempts: 1 }
    }

    /// Sets the number of open attempts.
    #[must_use]
    pub fn with_open_attempts(mut self, attempts: usize) -> Self {
        self.open_attempts = attempts;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.open_attempts == 0 {
            return Err(ConfigError("open_attempts must be > 0"));
        }
        Ok(())
    }
}
