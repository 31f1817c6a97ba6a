//! Connector configuration types and defaults.
//!
//! This module defines the options that control how engine statuses are
//! classified, whether freshly created contexts are checked for load errors,
//! and how often the background reclaimer sweeps the handle registry.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default status the engine uses to report a fatal, context-destroying error
pub const DEFAULT_FATAL_STATUS: i32 = crate::error::status::FATAL;

/// Default reclaimer period in milliseconds (30 s)
pub const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 30_000;

/// Smallest non-zero reclaimer period accepted by [`ConnectorConfig::validate`]
pub const MIN_RECLAIM_INTERVAL_MS: u64 = 10;

/// Configuration for a [`RuntimeConnector`](crate::RuntimeConnector)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Status returned by `invoke` that requires the context to be recreated
    #[serde(default = "default_fatal_status")]
    pub fatal_status: i32,

    /// Check `last_error` right after creation and reject contexts whose
    /// script failed to load (default: true)
    #[serde(default = "default_true")]
    pub check_compile_errors: bool,

    /// Period of the background registry sweep in milliseconds (0 = disabled)
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_ms: u64,

    /// Log every invocation at debug level (default: false)
    #[serde(default)]
    pub debug: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            fatal_status: DEFAULT_FATAL_STATUS,
            check_compile_errors: true,
            reclaim_interval_ms: DEFAULT_RECLAIM_INTERVAL_MS,
            debug: false,
        }
    }
}

impl ConnectorConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fatal status sentinel
    pub fn with_fatal_status(mut self, status: i32) -> Self {
        self.fatal_status = status;
        self
    }

    /// Enable or disable the post-creation compile check
    pub fn with_compile_check(mut self, enable: bool) -> Self {
        self.check_compile_errors = enable;
        self
    }

    /// Set the reclaimer period
    pub fn with_reclaim_interval_ms(mut self, ms: u64) -> Self {
        self.reclaim_interval_ms = ms;
        self
    }

    /// Enable debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fatal_status >= 0 {
            return Err(ConfigError::InvalidValue {
                field: "fatal_status".into(),
                reason: "must be negative, non-negative statuses mean success".into(),
            });
        }

        if self.reclaim_interval_ms != 0 && self.reclaim_interval_ms < MIN_RECLAIM_INTERVAL_MS {
            return Err(ConfigError::InvalidValue {
                field: "reclaim_interval_ms".into(),
                reason: format!("must be 0 or at least {}", MIN_RECLAIM_INTERVAL_MS),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_fatal_status() -> i32 {
    DEFAULT_FATAL_STATUS
}

fn default_reclaim_interval() -> u64 {
    DEFAULT_RECLAIM_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ConnectorConfig::default();
        assert_eq!(config.fatal_status, -1);
        assert!(config.check_compile_errors);
        assert_eq!(config.reclaim_interval_ms, DEFAULT_RECLAIM_INTERVAL_MS);
        assert!(!config.debug);
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectorConfig::new()
            .with_fatal_status(-99)
            .with_compile_check(false)
            .with_reclaim_interval_ms(0);

        assert_eq!(config.fatal_status, -99);
        assert!(!config.check_compile_errors);
        assert_eq!(config.reclaim_interval_ms, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(ConnectorConfig::new().with_fatal_status(0).validate().is_err());
        assert!(ConnectorConfig::new()
            .with_reclaim_interval_ms(5)
            .validate()
            .is_err());
        assert!(ConnectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ConnectorConfig::from_json_str(r#"{"fatalStatus": -7}"#).unwrap();
        assert_eq!(config.fatal_status, -7);
        assert!(config.check_compile_errors);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = ConnectorConfig::from_json_str(r#"{"fatalStatus": 3}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ConnectorConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Serialization(_)));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"checkCompileErrors": false, "debug": true}}"#).unwrap();

        let config = ConnectorConfig::from_file(file.path()).unwrap();
        assert!(!config.check_compile_errors);
        assert!(config.debug);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ConnectorConfig::from_file("/nonexistent/connector.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
