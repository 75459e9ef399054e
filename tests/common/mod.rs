//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use stepkernel::adapters::{ExecOutput, ExecRequest, Executor, ExecutorError};
use stepkernel::core::{ArtifactIndex, GraphRunner};
use stepkernel::domain::{GateSpec, StepSpec};

/// Scripted reply for one invocation
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(i32),
    Output(i32, &'static str),
    Timeout,
}

/// In-memory executor keyed by the command (argv joined by spaces).
///
/// Each command pops its next scripted reply; the last reply repeats once
/// the script is down to one entry. Unscripted commands exit 0.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, command: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), replies.into_iter().collect());
    }

    /// Every command run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| *c == command).count()
    }

    fn next_reply(&self, command: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Exit(0)),
            None => Reply::Exit(0),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError> {
        let command = request.argv.join(" ");
        self.calls.lock().unwrap().push(command.clone());

        match self.next_reply(&command) {
            Reply::Exit(code) => Ok(ExecOutput::new(code, "", "")),
            Reply::Output(code, stdout) => Ok(ExecOutput::new(code, stdout, "")),
            Reply::Timeout => Err(ExecutorError::Timeout(request.timeout)),
        }
    }
}

/// Temp workspace holding the shared index and run roots
pub struct Fixture {
    pub temp: TempDir,
    pub index: ArtifactIndex,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let index = ArtifactIndex::open(temp.path().join("index.sqlite3")).unwrap();
        Self { temp, index }
    }

    pub fn run_root(&self, name: &str) -> std::path::PathBuf {
        self.temp.path().join("runs").join(name)
    }

    pub fn runner(&self, executor: Arc<ScriptedExecutor>) -> GraphRunner {
        GraphRunner::new(executor, self.index.clone())
    }
}

pub fn step(step_id: &str, command: &str) -> StepSpec {
    StepSpec::new(step_id, argv(command))
}

pub fn gate(gate_id: &str, command: &str) -> GateSpec {
    GateSpec::new(gate_id, argv(command))
}

pub fn argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
