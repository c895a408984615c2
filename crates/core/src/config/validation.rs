//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::{AppConfig, UNLIMITED};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `cache_duration_minutes` or `cache_max_entries` is below `-1`
    /// - `cache_max_entries` is 0
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - a viewport dimension is 0
    ///
    /// Returns `ConfigError::Missing` if caching is enabled without a snapshot directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_enabled() && self.snapshot_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "snapshot_dir".into(),
                hint: "Set PRERENDER_SNAPSHOT_DIR environment variable".into(),
            });
        }

        if self.cache_duration_minutes < UNLIMITED {
            return Err(ConfigError::Invalid {
                field: "cache_duration_minutes".into(),
                reason: "must be -1 (unlimited) or a non-negative number of minutes".into(),
            });
        }

        if self.cache_max_entries < UNLIMITED || self.cache_max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "cache_max_entries".into(),
                reason: "must be -1 (unlimited) or greater than 0".into(),
            });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        for (field, value) in [
            ("width", self.width),
            ("height", self.height),
            ("width_mobile", self.width_mobile),
            ("height_mobile", self.height_mobile),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid { field: field.into(), reason: "must be greater than 0".into() });
            }
        }

        if self.tag_headers.is_empty() {
            tracing::warn!("tag_headers is empty; rendered pages will never carry invalidation tags");
        }

        Ok(())
    }
}
