//! Engine configuration.
//!
//! Every knob has a default so `EngineConfig::default()` is a working setup.
//! Hosts that want to tune precision policy, tracer capacity or template
//! caching can deserialize the same structure from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-level constants
pub const CRATE_NAME: &str = "medsig";
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relative loss above which a conversion is reported as a `PrecisionError`.
pub const DEFAULT_PRECISION_TOLERANCE: f64 = 0.01;

/// Significant digits kept when cleaning floating point noise from results.
pub const DEFAULT_SIGNIFICANT_DIGITS: u32 = 12;

/// Tracer ring buffer capacity.
pub const DEFAULT_MAX_TRACE_ENTRIES: usize = 1000;

/// Compiled template cache capacity.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 64;

pub const DEFAULT_LOCALE: &str = "en";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "medsig=debug"
    } else {
        "medsig=info"
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {0}: {1}")]
    Read(String, String),

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ═══════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════

/// Unit converter policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Maximum tolerated relative loss (0.01 = 1%).
    pub precision_tolerance: f64,
    /// When false, lossy conversions succeed and only log a warning.
    pub enforce_precision: bool,
    pub significant_digits: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            precision_tolerance: DEFAULT_PRECISION_TOLERANCE,
            enforce_precision: true,
            significant_digits: DEFAULT_SIGNIFICANT_DIGITS,
        }
    }
}

/// Conversion tracer behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub enabled: bool,
    /// Entries recorded in dry-run are flagged so callers can refuse to apply them.
    pub dry_run: bool,
    pub max_trace_entries: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            max_trace_entries: DEFAULT_MAX_TRACE_ENTRIES,
        }
    }
}

/// Template engine behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub default_locale: String,
    /// Locale consulted when the active one lacks a template key.
    pub fallback_locale: String,
    pub max_cache_size: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            default_locale: DEFAULT_LOCALE.into(),
            fallback_locale: DEFAULT_LOCALE.into(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub converter: ConverterConfig,
    pub tracer: TracerConfig,
    pub templates: TemplateConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.converter.precision_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "converter.precision_tolerance",
                reason: format!("must be a non-negative number, got {tolerance}"),
            });
        }
        if self.converter.significant_digits == 0 || self.converter.significant_digits > 17 {
            return Err(ConfigError::InvalidValue {
                field: "converter.significant_digits",
                reason: "must be between 1 and 17".into(),
            });
        }
        if self.tracer.max_trace_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracer.max_trace_entries",
                reason: "must be at least 1".into(),
            });
        }
        if self.templates.max_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "templates.max_cache_size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
