//! # Evaluator: the black-box objective function an Engine runs
//!
//! ## Responsibility
//! Turn a named parameter mapping into a named feature mapping. The real
//! simulation lives outside this crate; [`CommandEvaluator`] reaches it as a
//! child process speaking JSON over stdin/stdout.
//!
//! ## Guarantees
//! - Isolated: each evaluation runs in its own process
//! - Output-captured: stderr is kept for the error report on failure
//!
//! ## NOT Responsible For
//! - Timeouts (a hung evaluator stalls its Engine; accepted limitation)
//! - Extracting objective vectors (see: `map::mapping`)

use crate::config::{EvaluatorKind, EvaluatorSection};
use crate::protocol::{Features, ParamSet};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Failures of a single evaluation.
#[derive(Error, Debug)]
pub enum EvaluatorError {
    /// The evaluator process could not be started.
    #[error("failed to spawn evaluator {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The evaluator exited unsuccessfully.
    #[error("evaluator exited with {code:?}: {stderr}")]
    Exit {
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The evaluator's output was not a feature mapping.
    #[error("evaluator output is not a feature map: {0}")]
    Decode(#[from] serde_json::Error),

    /// Talking to the evaluator process failed.
    #[error("evaluator io error: {0}")]
    Io(#[from] std::io::Error),

    /// An in-process evaluator reported failure.
    #[error("evaluation failed: {0}")]
    Failed(String),
}

/// Something that scores one parameter mapping.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate `params` and return the features it produces.
    async fn evaluate(&self, params: &ParamSet) -> Result<Features, EvaluatorError>;
}

/// Runs an external program per evaluation.
///
/// The parameter mapping is written to the child's stdin as one JSON object;
/// the child must print one JSON object of `feature_name → number` on stdout
/// and exit zero.
///
/// # Usage
///
/// ```rust,no_run
/// use tokio_eval_dispatch::engine::evaluator::{CommandEvaluator, Evaluator};
/// use tokio_eval_dispatch::protocol::ParamSet;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let evaluator = CommandEvaluator::new("python3").arg("simplecell.py");
/// let mut params = ParamSet::new();
/// params.insert("gnabar_hh".to_string(), 0.1);
/// let features = evaluator.evaluate(&params).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandEvaluator {
    /// Evaluate by running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run the child in `dir`.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&self, params: &ParamSet) -> Result<Features, EvaluatorError> {
        let input = serde_json::to_vec(params)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| EvaluatorError::Spawn {
            program: self.program.display().to_string(),
            source: e,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EvaluatorError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            program = %self.program.display(),
            bytes = output.stdout.len(),
            "Evaluator finished"
        );
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Returns the parameters unchanged as features.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoEvaluator;

#[async_trait]
impl Evaluator for EchoEvaluator {
    async fn evaluate(&self, params: &ParamSet) -> Result<Features, EvaluatorError> {
        Ok(params.clone())
    }
}

/// Wraps a closure as an evaluator.
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&ParamSet) -> Result<Features, EvaluatorError> + Send + Sync,
{
    /// Evaluate with `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&ParamSet) -> Result<Features, EvaluatorError> + Send + Sync,
{
    async fn evaluate(&self, params: &ParamSet) -> Result<Features, EvaluatorError> {
        (self.f)(params)
    }
}

/// Build the evaluator named by `[engine.evaluator]`.
pub fn from_config(section: &EvaluatorSection) -> Arc<dyn Evaluator> {
    match section.kind {
        EvaluatorKind::Echo => Arc::new(EchoEvaluator),
        EvaluatorKind::Command => {
            let mut evaluator = CommandEvaluator::new(section.program.clone());
            for arg in &section.args {
                evaluator = evaluator.arg(arg.clone());
            }
            if let Some(dir) = &section.working_dir {
                evaluator = evaluator.working_dir(dir.clone());
            }
            Arc::new(evaluator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("gnabar_hh".to_string(), 0.1);
        p.insert("gkbar_hh".to_string(), 0.03);
        p
    }

    #[tokio::test]
    async fn test_echo_evaluator_returns_params() {
        let features = EchoEvaluator.evaluate(&params()).await.unwrap();
        assert_eq!(features, params());
    }

    #[tokio::test]
    async fn test_fn_evaluator_calls_closure() {
        let evaluator = FnEvaluator::new(|p: &ParamSet| {
            let sum: f64 = p.values().sum();
            let mut f = Features::new();
            f.insert("sum".to_string(), sum);
            Ok(f)
        });
        let features = evaluator.evaluate(&params()).await.unwrap();
        assert!((features["sum"] - 0.13).abs() < 1e-12);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_reads_stdout_json() {
        let evaluator = CommandEvaluator::new("sh")
            .arg("-c")
            .arg("cat > /dev/null; echo '{\"step1.Spikecount\": 2, \"step2.Spikecount\": 7}'");
        let features = evaluator.evaluate(&params()).await.unwrap();
        assert_eq!(features["step1.Spikecount"], 2.0);
        assert_eq!(features["step2.Spikecount"], 7.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_receives_params_on_stdin() {
        // `cat` echoes the parameter mapping back as the feature mapping.
        let evaluator = CommandEvaluator::new("cat");
        let features = evaluator.evaluate(&params()).await.unwrap();
        assert_eq!(features, params());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_nonzero_exit_is_error() {
        let evaluator = CommandEvaluator::new("sh")
            .arg("-c")
            .arg("cat > /dev/null; echo nope >&2; exit 3");
        match evaluator.evaluate(&params()).await {
            Err(EvaluatorError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_evaluator_bad_output_is_decode_error() {
        let evaluator = CommandEvaluator::new("sh").arg("-c").arg("cat > /dev/null; echo not json");
        assert!(matches!(
            evaluator.evaluate(&params()).await,
            Err(EvaluatorError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_command_evaluator_missing_program_is_spawn_error() {
        let evaluator = CommandEvaluator::new("/definitely/not/a/program");
        assert!(matches!(
            evaluator.evaluate(&params()).await,
            Err(EvaluatorError::Spawn { .. })
        ));
    }

    #[test]
    fn test_from_config_builds_echo() {
        let section = EvaluatorSection {
            kind: EvaluatorKind::Echo,
            ..EvaluatorSection::default()
        };
        let _evaluator = from_config(&section);
    }
}
