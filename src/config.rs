//! Engine configuration and the optional `vfsync.toml` file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::DEFAULT_MAX_RENAME_ATTEMPTS;
use crate::error::{Result, SyncError};

/// Config file name.
pub const CONFIG_FILE: &str = "vfsync.toml";

/// Default block size for checksums and diffs.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default quiet period before a burst of watch events is flushed.
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;

/// Configuration for sync rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Block size for checksums and diffs. Must be non-zero.
    pub block_size: usize,
    /// Quiet period, in milliseconds, that ends a burst of watch events.
    pub debounce_ms: u64,
    /// Attempts made to clear a conflicted-copy destination before giving up.
    pub max_rename_attempts: u32,
    /// Check whole-file digests after reconstructing a patched file.
    pub verify_digest: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_rename_attempts: DEFAULT_MAX_RENAME_ATTEMPTS,
            verify_digest: true,
        }
    }
}

impl SyncConfig {
    /// Debounce window for watch bursts.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Load `vfsync.toml` from `dir`, or defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero block size.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(SyncError::InvalidArgument(
                "block size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SyncConfig`].
///
/// # Example
///
/// ```rust
/// use vfsync::SyncBuilder;
///
/// let config = SyncBuilder::new()
///     .block_size(1024)
///     .verify_digest(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.block_size, 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyncBuilder {
    config: SyncConfig,
}

impl SyncBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size.
    #[must_use]
    pub const fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the watch debounce window in milliseconds.
    #[must_use]
    pub const fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    /// Set the rename retry bound.
    #[must_use]
    pub const fn max_rename_attempts(mut self, attempts: u32) -> Self {
        self.config.max_rename_attempts = attempts;
        self
    }

    /// Enable or disable digest verification after patch.
    #[must_use]
    pub const fn verify_digest(mut self, verify: bool) -> Self {
        self.config.verify_digest = verify;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero block size.
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
