//! # Config: process configuration for Map, Engines and Caller
//!
//! ## Responsibility
//! Describe everything a dispatch process needs to find its peers: the
//! transport, the shared exchange directory and file names, listening
//! ports, the evaluator to run and how parameter vectors are named.
//!
//! ## Guarantees
//! - Defaulted: every field has a documented default
//! - Validated: [`validation::validate`] checks cross-field constraints
//! - Shared: one TOML file can configure all three process kinds
//!
//! ## NOT Responsible For
//! - Reading files and environment (see: `loader`)
//! - Opening channels (see: `exchange::ChannelFactory`)

pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_transport() -> TransportKind {
    TransportKind::File
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Default polling interval: 100ms.
fn default_polling_interval_ms() -> u64 {
    100
}

/// Log the "still waiting" line once every 20 ticks.
fn default_log_every_ticks() -> u64 {
    20
}

fn default_command_board() -> PathBuf {
    PathBuf::from("master.json")
}

fn default_params_file() -> PathBuf {
    PathBuf::from("params.json")
}

fn default_objs_file() -> PathBuf {
    PathBuf::from("objs.json")
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_engine_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("engine_0"), PathBuf::from("engine_1")]
}

fn default_engine_dir() -> PathBuf {
    PathBuf::from("engine_0")
}

fn default_upstream_port() -> u16 {
    47100
}

fn default_caller_port() -> u16 {
    47101
}

fn default_evaluator_program() -> PathBuf {
    PathBuf::from("evaluate")
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration shared by the `map`, `engine` and `caller` binaries.
///
/// # Example
///
/// ```rust
/// use tokio_eval_dispatch::config::{DispatchConfig, TransportKind};
///
/// let config = DispatchConfig::default();
/// assert_eq!(config.exchange.transport, TransportKind::File);
/// assert_eq!(config.exchange.polling_interval_ms, 100);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Transport selection and shared file names.
    #[serde(default)]
    pub exchange: ExchangeSection,
    /// Coordinator settings.
    #[serde(default)]
    pub map: MapSection,
    /// Worker settings.
    #[serde(default)]
    pub engine: EngineSection,
    /// Caller adapter settings.
    #[serde(default)]
    pub caller: CallerSection,
    /// Parameter and objective naming.
    #[serde(default)]
    pub mapping: MappingSection,
}

impl DispatchConfig {
    /// Resolve a path from this config against the exchange directory.
    ///
    /// Absolute paths are returned unchanged.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.exchange.dir.join(path)
        }
    }

    /// The polling interval as a [`Duration`].
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.exchange.polling_interval_ms)
    }

    /// Absolute path of the command board (`master.json`).
    pub fn command_board_path(&self) -> PathBuf {
        self.resolve(&self.exchange.command_board)
    }

    /// Absolute path of the Caller → Map params file.
    pub fn params_path(&self) -> PathBuf {
        self.resolve(&self.exchange.params_file)
    }

    /// Absolute path of the Map → Caller objectives file.
    pub fn objs_path(&self) -> PathBuf {
        self.resolve(&self.exchange.objs_file)
    }

    /// Absolute paths of the Map's discovery directories.
    pub fn engine_dirs(&self) -> Vec<PathBuf> {
        self.map.engine_dirs.iter().map(|d| self.resolve(d)).collect()
    }

    /// Absolute path of this Engine's publication directory.
    pub fn engine_dir(&self) -> PathBuf {
        self.resolve(&self.engine.dir)
    }
}

/// Which [`crate::exchange::ExchangeChannel`] implementation carries traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Marker files in a shared directory, consumed by polling.
    File,
    /// Paired TCP request/reply links; discovery still uses files.
    Socket,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "socket" => Ok(Self::Socket),
            other => Err(ConfigError::InvalidField {
                field: "exchange.transport".to_string(),
                value: other.to_string(),
                reason: "expected \"file\" or \"socket\"".to_string(),
            }),
        }
    }
}

/// `[exchange]`: transport and shared paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeSection {
    /// Transport used for Map ↔ Engine and Caller ↔ Map traffic.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Root for every relative path in this config.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// Tick period of every control loop, in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Emit the periodic "waiting" log line every N ticks.
    #[serde(default = "default_log_every_ticks")]
    pub log_every_ticks: u64,
    /// Map → Engine command board.
    #[serde(default = "default_command_board")]
    pub command_board: PathBuf,
    /// Caller → Map batch request file.
    #[serde(default = "default_params_file")]
    pub params_file: PathBuf,
    /// Map → Caller batch reply file.
    #[serde(default = "default_objs_file")]
    pub objs_file: PathBuf,
    /// Interface socket listeners bind to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            dir: default_dir(),
            polling_interval_ms: default_polling_interval_ms(),
            log_every_ticks: default_log_every_ticks(),
            command_board: default_command_board(),
            params_file: default_params_file(),
            objs_file: default_objs_file(),
            bind_host: default_bind_host(),
        }
    }
}

/// `[map]`: coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapSection {
    /// Discovery directories, one per Engine slot.
    #[serde(default = "default_engine_dirs")]
    pub engine_dirs: Vec<PathBuf>,
    /// Host the Map advertises to Engines and the Caller.
    #[serde(default = "default_host")]
    pub host: String,
    /// Socket transport: port the Map listens on for the Caller.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
}

impl Default for MapSection {
    fn default() -> Self {
        Self {
            engine_dirs: default_engine_dirs(),
            host: default_host(),
            upstream_port: default_upstream_port(),
        }
    }
}

/// `[engine]`: worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Directory this Engine publishes `engine.json` and `result.json` into.
    #[serde(default = "default_engine_dir")]
    pub dir: PathBuf,
    /// Host placed in the discovery descriptor.
    #[serde(default = "default_host")]
    pub advertise_host: String,
    /// Evaluator to run for each task.
    #[serde(default)]
    pub evaluator: EvaluatorSection,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            dir: default_engine_dir(),
            advertise_host: default_host(),
            evaluator: EvaluatorSection::default(),
        }
    }
}

/// Which evaluator an Engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    /// Spawn `program args...`, JSON parameters on stdin, JSON features on stdout.
    Command,
    /// Return the parameters as features.
    Echo,
}

/// `[engine.evaluator]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluatorSection {
    /// Evaluator implementation.
    #[serde(default = "default_evaluator_kind")]
    pub kind: EvaluatorKind,
    /// Program to spawn (command evaluator only).
    #[serde(default = "default_evaluator_program")]
    pub program: PathBuf,
    /// Arguments passed to `program`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the spawned process. `None` inherits.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_evaluator_kind() -> EvaluatorKind {
    EvaluatorKind::Command
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        Self {
            kind: default_evaluator_kind(),
            program: default_evaluator_program(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

/// `[caller]`: caller adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallerSection {
    /// Host the Caller listens on for Map replies (socket transport).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the Caller listens on for Map replies (socket transport).
    #[serde(default = "default_caller_port")]
    pub port: u16,
}

impl Default for CallerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_caller_port(),
        }
    }
}

/// `[mapping]`: how parameter vectors and feature maps are named.
///
/// Empty `param_names` means positional names `x0, x1, ...`; empty
/// `objective_names` means every returned feature in name order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MappingSection {
    /// Names given to each position of a parameter vector.
    #[serde(default)]
    pub param_names: Vec<String>,
    /// Features extracted, in order, as the objective vector.
    #[serde(default)]
    pub objective_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_file_transport() {
        let config = DispatchConfig::default();
        assert_eq!(config.exchange.transport, TransportKind::File);
        assert_eq!(config.map.engine_dirs.len(), 2);
    }

    #[test]
    fn test_resolve_joins_relative_paths_to_exchange_dir() {
        let mut config = DispatchConfig::default();
        config.exchange.dir = PathBuf::from("/shared");
        assert_eq!(
            config.command_board_path(),
            PathBuf::from("/shared/master.json")
        );
        assert_eq!(
            config.engine_dirs(),
            vec![
                PathBuf::from("/shared/engine_0"),
                PathBuf::from("/shared/engine_1")
            ]
        );
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let mut config = DispatchConfig::default();
        config.exchange.dir = PathBuf::from("/shared");
        config.exchange.objs_file = PathBuf::from("/elsewhere/objs.json");
        assert_eq!(config.objs_path(), PathBuf::from("/elsewhere/objs.json"));
    }

    #[test]
    fn test_polling_interval_converts_millis() {
        let config = DispatchConfig::default();
        assert_eq!(config.polling_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_transport_kind_from_str_is_case_insensitive() {
        assert_eq!("Socket".parse::<TransportKind>().ok(), Some(TransportKind::Socket));
        assert_eq!(" file ".parse::<TransportKind>().ok(), Some(TransportKind::File));
        assert!("pigeon".parse::<TransportKind>().is_err());
    }
}
