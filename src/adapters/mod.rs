//! Executor interfaces for running step and gate commands.
//!
//! The kernel hands an `ExecRequest` to an `Executor` and gets back the
//! exit code and captured output. `local_command` is the only kind
//! implemented here.

pub mod local;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::ExecutorSpec;

pub use local::LocalCommandExecutor;

/// One command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub kind: String,
    pub argv: Vec<String>,
    /// Working directory (defaults to the process cwd)
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl ExecRequest {
    /// Build a request from a step executor or gate runner spec
    pub fn from_spec(spec: &ExecutorSpec, cwd: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            kind: spec.kind.clone(),
            argv: spec.argv.clone(),
            cwd,
            timeout,
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures to run a command at all (a nonzero exit is not an error)
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("empty argv")]
    EmptyArgv,

    #[error("unsupported executor kind: {0}")]
    UnsupportedKind(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("I/O error while waiting for command: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Stable short code recorded in attempt artifacts
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::EmptyArgv => "empty_argv",
            ExecutorError::UnsupportedKind(_) => "unsupported_kind",
            ExecutorError::Spawn { .. } => "spawn_failed",
            ExecutorError::Timeout(_) => "timeout",
            ExecutorError::Io(_) => "io",
        }
    }
}

/// Trait for command executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run one command to completion
    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_is_stable() {
        let err = ExecutorError::Timeout(Duration::from_millis(1500));
        assert!(err.to_string().starts_with("timeout"));
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn test_request_from_spec() {
        let spec = ExecutorSpec::local(vec!["echo".to_string(), "hi".to_string()]);
        let request = ExecRequest::from_spec(&spec, None, Duration::from_secs(5));
        assert_eq!(request.kind, "local_command");
        assert_eq!(request.argv, vec!["echo", "hi"]);
    }
}
