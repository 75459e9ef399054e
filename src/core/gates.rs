//! Post-success validation gates.
//!
//! Every declared gate of a step runs, in declaration order, once the
//! step's executor attempt succeeded. There is no short-circuit: a failing
//! gate does not stop later gates from running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, warn};

use super::artifact_store::ArtifactStore;
use super::run_log::RunLog;
use crate::adapters::{ExecRequest, Executor};
use crate::domain::{
    ArtifactSpec, Event, EventType, GateSpec, GateStatus, ProducerKind, StepSpec,
};

/// Artifact type of stored gate invocations
pub const GATE_RESULT_ARTIFACT: &str = "gate_result";

/// Outcome of one gate invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub gate_id: String,
    pub required: bool,
    pub passed: bool,
    /// Absent when the gate never produced an exit code
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub artifact_id: String,
}

/// Results of every gate of one step attempt, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateEvaluation {
    pub results: Vec<GateResult>,
}

impl GateEvaluation {
    /// `None` when no gates ran
    pub fn status(&self) -> Option<GateStatus> {
        if self.results.is_empty() {
            None
        } else if self.first_required_failure().is_some() {
            Some(GateStatus::Failed)
        } else {
            Some(GateStatus::Passed)
        }
    }

    pub fn first_required_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.required && !r.passed)
    }

    pub fn artifact_ids(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|r| r.artifact_id.as_str())
    }
}

/// Runs gates through an executor and records each invocation
pub struct GateEngine {
    executor: Arc<dyn Executor>,
    workspace: Option<PathBuf>,
}

impl GateEngine {
    pub fn new(executor: Arc<dyn Executor>, workspace: Option<PathBuf>) -> Self {
        Self {
            executor,
            workspace,
        }
    }

    /// Run every gate of `step` and persist one artifact per invocation.
    ///
    /// Each gate result lists `attempt_artifact` and the gate's own
    /// `inputs` as lineage inputs.
    pub async fn evaluate(
        &self,
        store: &ArtifactStore,
        log: &RunLog,
        step: &StepSpec,
        attempt: u32,
        attempt_artifact: &str,
        timeout: Duration,
    ) -> Result<GateEvaluation> {
        let mut evaluation = GateEvaluation::default();

        for gate in &step.gates {
            let result = self
                .run_gate(store, log, step, gate, attempt, attempt_artifact, timeout)
                .await?;
            evaluation.results.push(result);
        }

        Ok(evaluation)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_gate(
        &self,
        store: &ArtifactStore,
        log: &RunLog,
        step: &StepSpec,
        gate: &GateSpec,
        attempt: u32,
        attempt_artifact: &str,
        timeout: Duration,
    ) -> Result<GateResult> {
        let started = Instant::now();

        let (exit_code, stdout, stderr, error) = if gate.workspace_required
            && self.workspace.is_none()
        {
            (
                None,
                String::new(),
                String::new(),
                Some("workspace required but none configured".to_string()),
            )
        } else {
            let request = ExecRequest::from_spec(&gate.runner, self.workspace.clone(), timeout);
            match self.executor.run(&request).await {
                Ok(output) if output.success() => (Some(0), output.stdout, output.stderr, None),
                Ok(output) => {
                    let error = format!("exit code {}", output.exit_code);
                    (Some(output.exit_code), output.stdout, output.stderr, Some(error))
                }
                Err(e) => (None, String::new(), String::new(), Some(e.to_string())),
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let passed = error.is_none();

        let payload = json!({
            "step_id": step.step_id,
            "gate_id": gate.gate_id,
            "name": gate.name,
            "attempt": attempt,
            "required": gate.required,
            "argv": gate.runner.argv,
            "exit_code": exit_code,
            "passed": passed,
            "stdout": stdout,
            "stderr": stderr,
            "error": error,
            "duration_ms": duration_ms,
        });
        let spec = ArtifactSpec::new(
            GATE_RESULT_ARTIFACT,
            format!("{}/{}", step.step_id, gate.gate_id),
            ProducerKind::Gate,
        )
        .with_name(gate.gate_id.clone())
        .with_inputs(
            std::iter::once(attempt_artifact.to_string()).chain(gate.inputs.iter().cloned()),
        );

        let artifact = store
            .put_json(&payload, spec)
            .await
            .with_context(|| format!("Failed to store result of gate '{}'", gate.gate_id))?;

        if passed {
            debug!(step = %step.step_id, gate = %gate.gate_id, "Gate passed");
        } else {
            warn!(
                step = %step.step_id,
                gate = %gate.gate_id,
                required = gate.required,
                error = error.as_deref().unwrap_or_default(),
                "Gate failed"
            );
        }

        let summary = format!(
            "Gate {} {}",
            gate.gate_id,
            if passed { "passed" } else { "failed" }
        );
        let mut event = Event::new(
            store.run_id(),
            Some(step.step_id.clone()),
            EventType::GateEvaluated,
            summary,
        )
        .with_attempt(attempt)
        .with_duration(duration_ms)
        .with_artifact(artifact.artifact_id.clone());
        if let Some(ref error) = error {
            event = event.with_error(error.clone());
        }
        log.append(&event).await?;

        Ok(GateResult {
            gate_id: gate.gate_id.clone(),
            required: gate.required,
            passed,
            exit_code,
            error,
            artifact_id: artifact.artifact_id,
        })
    }
}
