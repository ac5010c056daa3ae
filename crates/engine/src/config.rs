//! Session factory configuration via TOML
//!
//! Every field has a default, so an empty document is a valid
//! configuration. The `[cache]` table is the second-level cache
//! configuration described in [`CacheSettings`].

use serde::{Deserialize, Serialize};
use std::path::Path;

use dormant_cache::CacheSettings;
use dormant_core::{Error, Result};

/// When a session flushes on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushMode {
    /// Flush before the transaction commits
    #[default]
    #[serde(alias = "auto")]
    Commit,
    /// Flush only when `flush()` is called
    Manual,
}

/// Session factory configuration
///
/// # Example
///
/// ```toml
/// order_inserts = true
/// flush_mode = "commit"
///
/// [cache]
/// default_access = "transactional"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFactoryConfig {
    /// Group inserts by entity within each dependency wave
    #[serde(default)]
    pub order_inserts: bool,
    /// Execute updates ordered by entity key
    #[serde(default)]
    pub order_updates: bool,
    /// When sessions flush
    #[serde(default)]
    pub flush_mode: FlushMode,
    /// Whether instances loaded by new sessions start read-only
    #[serde(default)]
    pub default_read_only: bool,
    /// Second-level cache
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for SessionFactoryConfig {
    fn default() -> Self {
        Self {
            order_inserts: false,
            order_updates: false,
            flush_mode: FlushMode::default(),
            default_read_only: false,
            cache: CacheSettings::default(),
        }
    }
}

impl SessionFactoryConfig {
    /// Configuration with the second-level cache disabled
    pub fn without_cache() -> Self {
        let mut config = Self::default();
        config.cache.enabled = false;
        config
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Dormant session factory configuration
#
# Group inserts by entity within each dependency wave (default: false)
order_inserts = false

# Execute updates ordered by entity key (default: false)
order_updates = false

# "commit" flushes before every commit, "manual" only on explicit flush
flush_mode = "commit"

# Instances loaded by new sessions start read-only (default: false)
default_read_only = false

[cache]
enabled = true
# "read-only", "nonstrict-read-write" or "transactional"
default_access = "transactional"

[cache.validator]
naked_put_invalidation_period_ms = 20000
pending_put_overage_period_ms = 5000
pending_put_recent_period_ms = 2000
max_pending_put_delay_ms = 120000
put_lock_timeout_ms = 100
invalidation_lock_timeout_ms = 60000

# Per-region access override
# [cache.regions.countries]
# access = "read-only"
"#
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for malformed TOML or invalid cache
    /// settings.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SessionFactoryConfig = toml::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))?;
        config.cache.validator.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Configuration`] if it cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            Error::Configuration(msg) => Error::Configuration(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Serialize this config to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("failed to serialize configuration: {}", e)))
    }
}
