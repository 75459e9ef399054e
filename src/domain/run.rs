//! Run state and per-step execution records.
//!
//! A `RunState` is owned by the single runner driving the run and is
//! written to `<run_root>/run_state.json` once the run is terminal.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::graph::GraphSpec;

/// File name of the persisted run state inside a run root
pub const RUN_STATE_FILE: &str = "run_state.json";

/// A single execution of a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,

    pub graph_id: String,

    pub status: RunStatus,

    /// One record per step of the graph (step_id -> record)
    pub step_records: BTreeMap<String, StepRunRecord>,

    /// Set when a rule escalated the run
    pub escalation_reason: Option<String>,

    pub escalation_step_id: Option<String>,

    /// Why the run failed, if it did
    #[serde(default)]
    pub failure_reason: Option<String>,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Create a running state with every step pending
    pub fn new(run_id: impl Into<String>, graph: &GraphSpec) -> Self {
        let step_records = graph
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepRunRecord::default()))
            .collect();

        Self {
            run_id: run_id.into(),
            graph_id: graph.graph_id.clone(),
            status: RunStatus::Running,
            step_records,
            escalation_reason: None,
            escalation_step_id: None,
            failure_reason: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Status of a step (pending if unknown)
    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.step_records
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRunRecord> {
        self.step_records.get(step_id)
    }

    pub fn record_mut(&mut self, step_id: &str) -> &mut StepRunRecord {
        self.step_records.entry(step_id.to_string()).or_default()
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Mark the run failed
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.failure_reason = Some(reason.into());
    }

    /// Mark the run blocked on a human decision
    pub fn block(&mut self, reason: impl Into<String>, step_id: impl Into<String>) {
        self.status = RunStatus::Blocked;
        self.escalation_reason = Some(reason.into());
        self.escalation_step_id = Some(step_id.into());
    }

    pub fn succeed(&mut self) {
        self.status = RunStatus::Succeeded;
    }

    /// Write the state to `<run_root>/run_state.json` with fsync
    pub fn save(&self, run_root: &Path) -> Result<PathBuf> {
        let path = run_root.join(RUN_STATE_FILE);
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize run state")?;

        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create run state: {}", path.display()))?;
        file.write_all(&json)
            .with_context(|| format!("Failed to write run state: {}", path.display()))?;
        file.flush()?;
        file.sync_all()
            .with_context(|| format!("Failed to sync run state: {}", path.display()))?;

        Ok(path)
    }

    /// Load a persisted state from a run root
    pub fn load(run_root: &Path) -> Result<Self> {
        let path = run_root.join(RUN_STATE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run state: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run state: {}", path.display()))
    }
}

/// Terminal and non-terminal run statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    /// Escalated; needs a decision rather than certainly failed
    Blocked,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Succeeded => write!(f, "SUCCEEDED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Per-step state machine: PENDING -> RUNNING -> SUCCEEDED | FAILED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not yet executed (or reset for another attempt)
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "PENDING"),
            StepStatus::Running => write!(f, "RUNNING"),
            StepStatus::Succeeded => write!(f, "SUCCEEDED"),
            StepStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Execution record of a single step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub status: StepStatus,

    /// Executor attempts made so far
    pub attempt_count: u32,

    /// Artifact ids of every gate invocation, in execution order
    #[serde(default)]
    pub gate_results: Vec<String>,

    /// Artifact ids of every executor attempt
    #[serde(default)]
    pub attempt_artifacts: Vec<String>,

    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::StepSpec;
    use tempfile::TempDir;

    fn graph() -> GraphSpec {
        GraphSpec {
            graph_id: "g".to_string(),
            steps: vec![
                StepSpec::new("a", vec!["true".to_string()]),
                StepSpec::new("b", vec!["true".to_string()]).depends_on("a"),
            ],
            routing_rules: Vec::new(),
        }
    }

    #[test]
    fn test_run_creation() {
        let run = RunState::new("run-1", &graph());

        assert!(run.is_running());
        assert_eq!(run.step_records.len(), 2);
        assert_eq!(run.step_status("a"), StepStatus::Pending);
        assert_eq!(run.step_status("b"), StepStatus::Pending);
    }

    #[test]
    fn test_block_records_escalation() {
        let mut run = RunState::new("run-1", &graph());
        run.block("needs review", "a");

        assert_eq!(run.status, RunStatus::Blocked);
        assert_eq!(run.escalation_reason.as_deref(), Some("needs review"));
        assert_eq!(run.escalation_step_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut run = RunState::new("run-1", &graph());
        run.record_mut("a").status = StepStatus::Failed;
        run.record_mut("a").last_error = Some("exit code 1".to_string());
        run.fail("step 'a' failed");

        run.save(temp.path()).unwrap();
        let loaded = RunState::load(temp.path()).unwrap();

        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.step_records, run.step_records);
        assert_eq!(loaded.failure_reason.as_deref(), Some("step 'a' failed"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&StepStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let json = serde_json::to_string(&RunStatus::Blocked).unwrap();
        assert_eq!(json, "\"BLOCKED\"");
    }
}
