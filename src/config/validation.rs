//! Configuration validation.
//!
//! ## Responsibility
//! Check semantic constraints on a parsed [`DispatchConfig`] that the type
//! system cannot express (ranges, duplicates, transport-dependent ports).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages name the field path and the offending value
//!
//! ## NOT Responsible For
//! - Parsing TOML or reading the environment (that belongs to `loader`)

use super::{DispatchConfig, TransportKind};
use std::collections::HashSet;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "exchange.polling_interval_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate all semantic constraints on a [`DispatchConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &DispatchConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let interval = config.exchange.polling_interval_ms;
    if !(1..=1000).contains(&interval) {
        errors.push(invalid(
            "exchange.polling_interval_ms",
            interval,
            "must be between 1 and 1000",
        ));
    }
    if config.exchange.log_every_ticks == 0 {
        errors.push(invalid("exchange.log_every_ticks", 0, "must be > 0"));
    }

    if config.map.engine_dirs.is_empty() {
        errors.push(invalid("map.engine_dirs", "[]", "at least one directory required"));
    }
    let mut seen = HashSet::new();
    for dir in &config.map.engine_dirs {
        if !seen.insert(dir) {
            errors.push(invalid(
                "map.engine_dirs",
                dir.display(),
                "duplicate discovery directory",
            ));
        }
    }

    if config.exchange.transport == TransportKind::Socket {
        if config.map.upstream_port == 0 {
            errors.push(invalid(
                "map.upstream_port",
                0,
                "socket transport needs a fixed port the caller can reach",
            ));
        }
        if config.caller.port == 0 {
            errors.push(invalid(
                "caller.port",
                0,
                "socket transport needs a fixed port the map can reach",
            ));
        }
    }

    for (field, names) in [
        ("mapping.param_names", &config.mapping.param_names),
        ("mapping.objective_names", &config.mapping.objective_names),
    ] {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                errors.push(invalid(field, name, "duplicate name"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
