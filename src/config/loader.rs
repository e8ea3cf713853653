//! Configuration loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`DispatchConfig`], apply
//! environment overrides and run validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - Environment overrides are applied after parsing, before validation
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::{Path, PathBuf};

use super::validation::{self, ConfigError};
use super::DispatchConfig;

/// Overrides the transport (`file` | `socket`).
pub const ENV_TRANSPORT: &str = "DISPATCH_TRANSPORT";
/// Overrides `exchange.dir`.
pub const ENV_EXCHANGE_DIR: &str = "DISPATCH_EXCHANGE_DIR";
/// Overrides `exchange.polling_interval_ms`.
pub const ENV_POLLING_MS: &str = "DISPATCH_POLLING_MS";
/// Overrides `engine.dir`, so several Engines can share one config file.
pub const ENV_ENGINE_DIR: &str = "DISPATCH_ENGINE_DIR";
/// Overrides `engine.advertise_host`.
pub const ENV_ADVERTISE_HOST: &str = "DISPATCH_ADVERTISE_HOST";
/// Overrides `map.host`.
pub const ENV_MAP_HOST: &str = "DISPATCH_MAP_HOST";

/// Load a [`DispatchConfig`] from a TOML file, with process environment overrides.
///
/// # Errors
///
/// - [`ConfigError::Io`] if the file cannot be read.
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
pub fn load_from_file(path: &Path) -> Result<DispatchConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`DispatchConfig`] from a TOML string, with process environment overrides.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::InvalidField`] if an override cannot be parsed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<DispatchConfig, ConfigError> {
    load_with_env(content, source_name, |key| std::env::var(key).ok())
}

/// Build the config used when no file is given: defaults plus environment.
///
/// # Errors
///
/// Same as [`load_from_str`].
pub fn load_default() -> Result<DispatchConfig, ConfigError> {
    load_from_str("", "<defaults>")
}

/// Parse, override from `lookup`, validate.
///
/// `lookup` stands in for `std::env::var` so tests never touch the process
/// environment.
pub fn load_with_env<F>(
    content: &str,
    source_name: &str,
    lookup: F,
) -> Result<DispatchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: DispatchConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    apply_env_overrides(&mut config, lookup)?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

/// Apply the `DISPATCH_*` overrides found through `lookup`.
///
/// # Errors
///
/// [`ConfigError::InvalidField`] when a value does not parse.
pub fn apply_env_overrides<F>(config: &mut DispatchConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_TRANSPORT) {
        config.exchange.transport = value.parse()?;
    }
    if let Some(value) = lookup(ENV_EXCHANGE_DIR) {
        config.exchange.dir = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_POLLING_MS) {
        config.exchange.polling_interval_ms =
            value.trim().parse().map_err(|_| ConfigError::InvalidField {
                field: "exchange.polling_interval_ms".to_string(),
                value: value.clone(),
                reason: format!("{ENV_POLLING_MS} must be an integer"),
            })?;
    }
    if let Some(value) = lookup(ENV_ENGINE_DIR) {
        config.engine.dir = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_ADVERTISE_HOST) {
        config.engine.advertise_host = value;
    }
    if let Some(value) = lookup(ENV_MAP_HOST) {
        config.map.host = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::collections::HashMap;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[exchange]
transport = "socket"
dir = "/shared"
polling_interval_ms = 250

[map]
engine_dirs = ["input_3", "input_4"]
upstream_port = 5000

[engine]
dir = "output_1"

[engine.evaluator]
kind = "echo"

[mapping]
param_names = ["gnabar_hh", "gkbar_hh"]
objective_names = ["step1.Spikecount", "step2.Spikecount"]
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_with_env_valid_toml_succeeds() {
        let config = load_with_env(VALID_TOML, "test", no_env);
        assert!(config.is_ok());
        let config = config.unwrap_or_default();
        assert_eq!(config.exchange.transport, TransportKind::Socket);
        assert_eq!(config.exchange.polling_interval_ms, 250);
        assert_eq!(config.map.engine_dirs.len(), 2);
        assert_eq!(config.mapping.param_names[0], "gnabar_hh");
    }

    #[test]
    fn test_load_with_env_empty_input_gives_defaults() {
        let config = load_with_env("", "empty", no_env).unwrap_or_default();
        assert_eq!(config, DispatchConfig::default());
    }

    #[test]
    fn test_load_with_env_invalid_toml_returns_parse_error() {
        let result = load_with_env("not valid toml [[[", "bad.toml", no_env);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_with_env_unknown_transport_returns_parse_error() {
        let result = load_with_env("[exchange]\ntransport = \"carrier-pigeon\"", "t", no_env);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_with_env_validation_failure_is_reported() {
        let result = load_with_env("[exchange]\npolling_interval_ms = 0", "t", no_env);
        match result {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("polling_interval_ms")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_TRANSPORT, "file"),
            (ENV_EXCHANGE_DIR, "/tmp/exchange"),
            (ENV_POLLING_MS, "20"),
            (ENV_ENGINE_DIR, "engine_7"),
            (ENV_ADVERTISE_HOST, "evaluator1"),
            (ENV_MAP_HOST, "map"),
        ]
        .into_iter()
        .collect();
        let config = load_with_env(VALID_TOML, "test", |k| env.get(k).map(|v| v.to_string()))
            .unwrap_or_default();
        assert_eq!(config.exchange.transport, TransportKind::File);
        assert_eq!(config.exchange.dir, PathBuf::from("/tmp/exchange"));
        assert_eq!(config.exchange.polling_interval_ms, 20);
        assert_eq!(config.engine.dir, PathBuf::from("engine_7"));
        assert_eq!(config.engine.advertise_host, "evaluator1");
        assert_eq!(config.map.host, "map");
    }

    #[test]
    fn test_env_override_with_bad_number_is_invalid_field() {
        let result = load_with_env("", "t", |k| {
            (k == ENV_POLLING_MS).then(|| "fast".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidField { .. })));
    }

    #[test]
    fn test_load_from_file_reads_toml() {
        let dir = tempfile::tempdir();
        assert!(dir.is_ok());
        let Ok(dir) = dir else { return };
        let path = dir.path().join("dispatch.toml");
        let written = std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(b"[map]\nengine_dirs = [\"only\"]\n"));
        assert!(written.is_ok());
        let config = load_from_file(&path);
        assert!(config.is_ok());
        assert_eq!(
            config.unwrap_or_default().map.engine_dirs,
            vec![PathBuf::from("only")]
        );
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/definitely/not/here.toml"));
        match result {
            Err(ConfigError::Io { file, .. }) => assert!(file.contains("here.toml")),
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
