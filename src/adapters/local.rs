//! `local_command` executor: runs argv as a child process.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ExecOutput, ExecRequest, Executor, ExecutorError};
use crate::domain::LOCAL_COMMAND;

/// Executor that spawns local processes
#[derive(Debug, Clone, Default)]
pub struct LocalCommandExecutor;

impl LocalCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalCommandExecutor {
    fn name(&self) -> &str {
        LOCAL_COMMAND
    }

    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError> {
        if request.kind != LOCAL_COMMAND {
            return Err(ExecutorError::UnsupportedKind(request.kind.clone()));
        }
        let (program, args) = request.argv.split_first().ok_or(ExecutorError::EmptyArgv)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = request.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;

        debug!(program = %program, timeout = ?request.timeout, "Spawned command");

        // Dropping the wait future on expiry drops the child, which kills it
        let output = match timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(program = %program, timeout = ?request.timeout, "Command timed out");
                return Err(ExecutorError::Timeout(request.timeout));
            }
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
