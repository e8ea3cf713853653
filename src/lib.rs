//! # tokio-eval-dispatch
//!
//! Batch evaluation of parameter vectors across a pool of worker processes
//! that only share a directory, or a pair of TCP ports.
//!
//! ## Architecture
//!
//! One coordinator (the Map) between one caller and N workers (Engines):
//! ```text
//! Caller ──map──► Map ──eval──► Engine × N
//!        ◄─objs──     ◄─result─
//! ```
//! Every process runs a single tick-driven control loop; the transport is
//! chosen from configuration (`file` or `socket`).

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub mod caller;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod map;
pub mod protocol;
pub mod scheduler;

// Re-exports for convenience
pub use caller::CallerAdapter;
pub use config::{ConfigError, DispatchConfig, TransportKind};
pub use engine::evaluator::{CommandEvaluator, EchoEvaluator, Evaluator, EvaluatorError, FnEvaluator};
pub use engine::Engine;
pub use exchange::{ChannelFactory, ExchangeChannel, ExchangeError};
pub use map::{Coordinator, MapStatus};

use protocol::{EngineStatus, RequestId, TaskId};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON lines, suitable for log aggregation
/// - anything else (default): human-readable pretty output
///
/// Filtering follows `RUST_LOG` through [`EnvFilter`].
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if a global subscriber is already set.
///
/// # Example
///
/// ```no_run
/// # use tokio_eval_dispatch::{init_tracing, DispatchError};
/// # fn example() -> Result<(), DispatchError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), DispatchError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DispatchError::Other(format!("tracing init failed: {e}")))
}

/// Top-level dispatch errors.
///
/// Every variant is fatal: the process that hits one logs it and exits.
/// Nothing is retried. A message that has not arrived yet is never an error.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A peer broke the protocol (unknown command, wrong state, bad reply).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An Engine was first seen in a status other than `connecting`.
    #[error("cannot register engine {engine_id} advertising status {status}")]
    Registration {
        /// Engine that tried to register.
        engine_id: Uuid,
        /// Status it advertised.
        status: EngineStatus,
    },

    /// A result arrived for a task that is not running.
    #[error("result for task {task_id} matches no running task")]
    UnknownTask {
        /// Task id carried by the result.
        task_id: TaskId,
    },

    /// A batch arrived while another one is still open.
    #[error("batch request received while batch {open} is still open")]
    BatchInProgress {
        /// The open batch.
        open: RequestId,
    },

    /// The Map's reply does not have one entry per input vector.
    #[error("expected {expected} objective vectors, got {actual}")]
    ResultLength {
        /// Number of input vectors.
        expected: usize,
        /// Number of objective vectors received.
        actual: usize,
    },

    /// A parameter vector does not match the configured names.
    #[error("parameter vector has {actual} values, {expected} names configured")]
    ParamArity {
        /// Number of configured names.
        expected: usize,
        /// Length of the vector.
        actual: usize,
    },

    /// An evaluator result lacks a configured objective.
    #[error("evaluator result has no feature {feature}")]
    MissingFeature {
        /// The missing feature name.
        feature: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Evaluator failure.
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    /// `true` for protocol violations, whether detected here or by a channel.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::Registration { .. }
                | Self::UnknownTask { .. }
                | Self::BatchInProgress { .. }
                | Self::Exchange(ExchangeError::ProtocolViolation(_))
        )
    }
}
