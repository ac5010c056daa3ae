//! Second-level cache configuration
//!
//! Loaded from the `[cache]` table of the session factory configuration or
//! from a standalone TOML document:
//!
//! ```toml
//! enabled = true
//! default_access = "transactional"
//!
//! [validator]
//! naked_put_invalidation_period_ms = 20000
//!
//! [regions.orders]
//! access = "read-only"
//! ```

use dormant_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Concurrency strategy of a cache region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    /// Entries are never updated; updates are errors
    ReadOnly,
    /// Entries are evicted on write, no put-from-load validation
    NonstrictReadWrite,
    /// Writes invalidate through the put-from-load validator
    #[default]
    Transactional,
}

impl AccessType {
    /// Configuration name
    pub fn name(self) -> &'static str {
        match self {
            AccessType::ReadOnly => "read-only",
            AccessType::NonstrictReadWrite => "nonstrict-read-write",
            AccessType::Transactional => "transactional",
        }
    }
}

/// Timing of the put-from-load validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSettings {
    /// After an invalidation, unregistered puts are refused for this long
    #[serde(default = "default_naked_put_invalidation_period_ms")]
    pub naked_put_invalidation_period_ms: u64,
    /// Pending puts older than this move to the overage queue
    #[serde(default = "default_pending_put_overage_period_ms")]
    pub pending_put_overage_period_ms: u64,
    /// Pending puts younger than this are never examined by housekeeping
    #[serde(default = "default_pending_put_recent_period_ms")]
    pub pending_put_recent_period_ms: u64,
    /// Pending puts still outstanding after this are discarded
    #[serde(default = "default_max_pending_put_delay_ms")]
    pub max_pending_put_delay_ms: u64,
    /// How long a put waits for another put on the same key
    #[serde(default = "default_put_lock_timeout_ms")]
    pub put_lock_timeout_ms: u64,
    /// How long an invalidation waits for an in-flight put on the key
    #[serde(default = "default_invalidation_lock_timeout_ms")]
    pub invalidation_lock_timeout_ms: u64,
}

fn default_naked_put_invalidation_period_ms() -> u64 {
    20_000
}

fn default_pending_put_overage_period_ms() -> u64 {
    5_000
}

fn default_pending_put_recent_period_ms() -> u64 {
    2_000
}

fn default_max_pending_put_delay_ms() -> u64 {
    120_000
}

fn default_put_lock_timeout_ms() -> u64 {
    100
}

fn default_invalidation_lock_timeout_ms() -> u64 {
    60_000
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            naked_put_invalidation_period_ms: default_naked_put_invalidation_period_ms(),
            pending_put_overage_period_ms: default_pending_put_overage_period_ms(),
            pending_put_recent_period_ms: default_pending_put_recent_period_ms(),
            max_pending_put_delay_ms: default_max_pending_put_delay_ms(),
            put_lock_timeout_ms: default_put_lock_timeout_ms(),
            invalidation_lock_timeout_ms: default_invalidation_lock_timeout_ms(),
        }
    }
}

impl ValidatorSettings {
    /// Put lock wait as a `Duration`
    pub fn put_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.put_lock_timeout_ms)
    }

    /// Invalidation wait as a `Duration`
    pub fn invalidation_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidation_lock_timeout_ms)
    }

    /// Check the periods are consistent
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] unless
    /// `recent <= overage <= max_pending_put_delay`.
    pub fn validate(&self) -> Result<()> {
        if self.pending_put_recent_period_ms > self.pending_put_overage_period_ms {
            return Err(Error::Configuration(
                "pending_put_recent_period_ms must not exceed pending_put_overage_period_ms".into(),
            ));
        }
        if self.pending_put_overage_period_ms > self.max_pending_put_delay_ms {
            return Err(Error::Configuration(
                "pending_put_overage_period_ms must not exceed max_pending_put_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Per-region overrides
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionSettings {
    /// Access type for this region; falls back to `default_access`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessType>,
}

/// Second-level cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Use the second-level cache at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Access type of regions without an override
    #[serde(default)]
    pub default_access: AccessType,
    /// Put-from-load validator timing
    #[serde(default)]
    pub validator: ValidatorSettings,
    /// Overrides by region name
    #[serde(default)]
    pub regions: BTreeMap<String, RegionSettings>,
}

fn default_enabled() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_access: AccessType::default(),
            validator: ValidatorSettings::default(),
            regions: BTreeMap::new(),
        }
    }
}

impl CacheSettings {
    /// Access type configured for `region`
    pub fn access_for(&self, region: &str) -> AccessType {
        self.regions
            .get(region)
            .and_then(|r| r.access)
            .unwrap_or(self.default_access)
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for malformed TOML or inconsistent
    /// validator timing.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: CacheSettings = toml::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid cache settings: {}", e)))?;
        settings.validator.validate()?;
        Ok(settings)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_validator_constants() {
        let settings = ValidatorSettings::default();
        assert_eq!(settings.naked_put_invalidation_period_ms, 20_000);
        assert_eq!(settings.pending_put_overage_period_ms, 5_000);
        assert_eq!(settings.pending_put_recent_period_ms, 2_000);
        assert_eq!(settings.max_pending_put_delay_ms, 120_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CacheSettings::from_toml_str("").unwrap(), CacheSettings::default());
    }

    #[test]
    fn test_region_override() {
        let settings = CacheSettings::from_toml_str(
            r#"
            default_access = "nonstrict-read-write"

            [regions.countries]
            access = "read-only"
            "#,
        )
        .unwrap();
        assert_eq!(settings.access_for("countries"), AccessType::ReadOnly);
        assert_eq!(settings.access_for("orders"), AccessType::NonstrictReadWrite);
    }

    #[test]
    fn test_inconsistent_periods_rejected() {
        let err = CacheSettings::from_toml_str(
            r#"
            [validator]
            pending_put_overage_period_ms = 500000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enabled = false").unwrap();
        let settings = CacheSettings::from_file(file.path()).unwrap();
        assert!(!settings.enabled);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheSettings::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_unknown_access_type_rejected() {
        let err = CacheSettings::from_toml_str(r#"default_access = "eventual""#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
