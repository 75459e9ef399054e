//! Graph runner: the state machine that drives a run to a terminal status.
//!
//! Steps run strictly one at a time. After every executor attempt (and its
//! gates) the routing rules are consulted; the default failure policy only
//! applies when no rule matches.
//!
//! A step reset by a retry or a GOTO runs next, before any other pending
//! step and regardless of its dependencies.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::artifact_store::ArtifactStore;
use super::gates::GateEngine;
use super::index::ArtifactIndex;
use super::registry::{merge_routing_rules, SchemaRegistry};
use super::routing::RoutingEngine;
use super::run_log::RunLog;
use crate::adapters::{ExecRequest, Executor};
use crate::config::LimitSettings;
use crate::domain::{
    ActionType, ArtifactSpec, Event, EventType, GateStatus, GraphSpec, ProducerKind,
    RoutingRule, RunState, RunStatus, StepOutcome, StepSpec, StepStatus,
};

/// Artifact type of stored executor attempts
pub const STEP_ATTEMPT_ARTIFACT: &str = "step_attempt";

/// Per-run bounds that keep routing loops finite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Cap on executor invocations across all steps
    pub max_step_executions: u32,
    /// Wall-clock budget for the whole run
    pub run_timeout: Duration,
    /// Used when a step sets no timeout of its own
    pub default_step_timeout: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from(&LimitSettings::default())
    }
}

impl From<&LimitSettings> for RunLimits {
    fn from(settings: &LimitSettings) -> Self {
        Self {
            max_step_executions: settings.max_step_executions,
            run_timeout: settings.run_timeout(),
            default_step_timeout: settings.default_step_timeout(),
        }
    }
}

/// Executes graphs against an executor and a shared artifact index
pub struct GraphRunner {
    executor: Arc<dyn Executor>,
    index: ArtifactIndex,
    limits: RunLimits,
    workspace: Option<PathBuf>,
    schemas: Option<Arc<SchemaRegistry>>,
    /// Rules evaluated after the graph's own rules
    extra_rules: Vec<RoutingRule>,
}

impl GraphRunner {
    pub fn new(executor: Arc<dyn Executor>, index: ArtifactIndex) -> Self {
        Self {
            executor,
            index,
            limits: RunLimits::default(),
            workspace: None,
            schemas: None,
            extra_rules: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Working directory for steps and gates
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// Append rules (e.g. merged pack rules) after the graph's own rules
    pub fn with_routing_rules(mut self, rules: Vec<RoutingRule>) -> Self {
        self.extra_rules.extend(rules);
        self
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Run a graph under a fresh run id
    pub async fn run_graph(&self, run_root: &Path, graph: &GraphSpec) -> Result<RunState> {
        let run_id = Uuid::new_v4().to_string();
        self.run_graph_with_id(&run_id, run_root, graph).await
    }

    /// Run a graph to a terminal status and persist the final state
    #[instrument(skip(self, graph), fields(graph_id = %graph.graph_id))]
    pub async fn run_graph_with_id(
        &self,
        run_id: &str,
        run_root: &Path,
        graph: &GraphSpec,
    ) -> Result<RunState> {
        graph
            .validate()
            .with_context(|| format!("Invalid graph '{}'", graph.graph_id))?;
        let rules = merge_routing_rules([
            ("graph", graph.routing_rules.as_slice()),
            ("packs", self.extra_rules.as_slice()),
        ])?;
        graph.validate_rule_targets(&rules)?;
        let order = graph.topological_order()?;
        let routing = RoutingEngine::new(rules);

        let mut store = ArtifactStore::create(run_root, run_id, self.index.clone())
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_root.display()))?;
        if let Some(ref schemas) = self.schemas {
            store = store.with_schemas(Arc::clone(schemas));
        }
        let log = RunLog::for_run(run_root);
        let gates = GateEngine::new(Arc::clone(&self.executor), self.workspace.clone());

        let mut state = RunState::new(run_id, graph);
        info!(steps = graph.steps.len(), rules = routing.rules().len(), "Starting run");
        log.append(&Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("Graph '{}' started", graph.graph_id),
        ))
        .await?;

        let started = Instant::now();
        let mut executions: u32 = 0;
        let mut redirect: Option<String> = None;

        while state.is_running() {
            if started.elapsed() >= self.limits.run_timeout {
                state.fail(format!(
                    "run timeout of {}s exceeded",
                    self.limits.run_timeout.as_secs()
                ));
                break;
            }

            let Some(step_id) = redirect
                .take()
                .or_else(|| next_eligible(&order, graph, &state))
            else {
                state.succeed();
                break;
            };

            if executions >= self.limits.max_step_executions {
                state.fail(format!(
                    "step execution limit of {} reached",
                    self.limits.max_step_executions
                ));
                break;
            }
            executions += 1;

            let step = graph
                .step(&step_id)
                .with_context(|| format!("Scheduled unknown step '{}'", step_id))?;

            let outcome = self.execute_step(&store, &log, &gates, step, &mut state).await?;
            self.route(&routing, &log, step, &outcome, &mut state, &mut redirect)
                .await?;
        }

        self.finish_run(&log, &mut state, run_root).await?;
        Ok(state)
    }

    /// One executor attempt plus gates, recorded on the step
    async fn execute_step(
        &self,
        store: &ArtifactStore,
        log: &RunLog,
        gates: &GateEngine,
        step: &StepSpec,
        state: &mut RunState,
    ) -> Result<StepOutcome> {
        let run_id = state.run_id.clone();
        let attempt = {
            let record = state.record_mut(&step.step_id);
            record.status = StepStatus::Running;
            record.attempt_count += 1;
            record.attempt_count
        };

        info!(step = %step.step_id, attempt, "Executing step");
        log.append(
            &Event::new(
                &run_id,
                Some(step.step_id.clone()),
                EventType::StepStarted,
                format!("Step {} started", step.step_id),
            )
            .with_attempt(attempt),
        )
        .await?;

        let timeout = step.timeout(self.limits.default_step_timeout);
        let request = ExecRequest::from_spec(&step.executor, self.workspace.clone(), timeout);
        let step_started = Instant::now();
        let result = self.executor.run(&request).await;
        let duration_ms = step_started.elapsed().as_millis() as u64;

        let (exit_code, stdout, stderr, error, error_code) = match result {
            Ok(output) if output.success() => (Some(0), output.stdout, output.stderr, None, None),
            Ok(output) => {
                let error = format!("exit code {}", output.exit_code);
                (
                    Some(output.exit_code),
                    output.stdout,
                    output.stderr,
                    Some(error),
                    Some("nonzero_exit"),
                )
            }
            Err(e) => (None, String::new(), String::new(), Some(e.to_string()), Some(e.code())),
        };

        let payload = json!({
            "step_id": step.step_id,
            "attempt": attempt,
            "argv": step.executor.argv,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "error": error,
            "error_code": error_code,
            "duration_ms": duration_ms,
            "output_schema_ids": step.output_schema_ids,
        });
        let spec = ArtifactSpec::new(STEP_ATTEMPT_ARTIFACT, &step.step_id, ProducerKind::Step)
            .with_name(format!("{}#{}", step.step_id, attempt))
            .with_inputs(step.input_artifact_ids.iter().cloned());
        let attempt_artifact = store
            .put_json(&payload, spec)
            .await
            .with_context(|| format!("Failed to store attempt of step '{}'", step.step_id))?;
        state
            .record_mut(&step.step_id)
            .attempt_artifacts
            .push(attempt_artifact.artifact_id.clone());

        if let Some(error) = error {
            let retry_exhausted = step.retry_policy.is_exhausted(attempt);
            warn!(step = %step.step_id, attempt, %error, retry_exhausted, "Step attempt failed");

            let record = state.record_mut(&step.step_id);
            record.status = StepStatus::Failed;
            record.last_error = Some(error.clone());

            log.append(
                &Event::new(
                    &run_id,
                    Some(step.step_id.clone()),
                    EventType::StepFailed,
                    format!("Step {} failed", step.step_id),
                )
                .with_attempt(attempt)
                .with_duration(duration_ms)
                .with_error(error)
                .with_artifact(attempt_artifact.artifact_id),
            )
            .await?;

            return Ok(StepOutcome {
                step_id: step.step_id.clone(),
                step_status: StepStatus::Failed,
                gate_status: None,
                retry_exhausted,
                attempt,
            });
        }

        let evaluation = gates
            .evaluate(
                store,
                log,
                step,
                attempt,
                &attempt_artifact.artifact_id,
                timeout,
            )
            .await?;
        let gate_failure = evaluation
            .first_required_failure()
            .map(|g| format!("gate failed: {}", g.gate_id));

        let record = state.record_mut(&step.step_id);
        record
            .gate_results
            .extend(evaluation.artifact_ids().map(str::to_string));

        let (status, event) = match gate_failure {
            Some(error) => {
                warn!(step = %step.step_id, %error, "Required gate failed");
                record.status = StepStatus::Failed;
                record.last_error = Some(error.clone());
                let event = Event::new(
                    &run_id,
                    Some(step.step_id.clone()),
                    EventType::StepFailed,
                    format!("Step {} failed its gates", step.step_id),
                )
                .with_error(error);
                (StepStatus::Failed, event)
            }
            None => {
                info!(step = %step.step_id, attempt, duration_ms, "Step succeeded");
                record.status = StepStatus::Succeeded;
                record.last_error = None;
                let event = Event::new(
                    &run_id,
                    Some(step.step_id.clone()),
                    EventType::StepSucceeded,
                    format!("Step {} succeeded", step.step_id),
                );
                (StepStatus::Succeeded, event)
            }
        };

        log.append(
            &event
                .with_attempt(attempt)
                .with_duration(duration_ms)
                .with_artifact(attempt_artifact.artifact_id),
        )
        .await?;

        Ok(StepOutcome {
            step_id: step.step_id.clone(),
            step_status: status,
            gate_status: evaluation.status(),
            retry_exhausted: false,
            attempt,
        })
    }

    /// Apply the first matching rule, or the default policy
    async fn route(
        &self,
        routing: &RoutingEngine,
        log: &RunLog,
        step: &StepSpec,
        outcome: &StepOutcome,
        state: &mut RunState,
        redirect: &mut Option<String>,
    ) -> Result<()> {
        let Some(rule) = routing.evaluate(outcome) else {
            return self
                .apply_default_policy(log, step, outcome, state, redirect)
                .await;
        };

        let action = &rule.action;
        let target = action
            .target_step_id
            .clone()
            .unwrap_or_else(|| step.step_id.clone());
        info!(
            rule = %rule.rule_id,
            step = %step.step_id,
            action = ?action.action_type,
            target = %target,
            "Routing rule matched"
        );

        let summary = match action.action_type {
            ActionType::RetryStep => {
                state.record_mut(&target).status = StepStatus::Pending;
                *redirect = Some(target.clone());
                format!("Rule {} retries step {}", rule.rule_id, target)
            }
            ActionType::GotoStep => {
                state.record_mut(&target).status = StepStatus::Pending;
                *redirect = Some(target.clone());
                format!("Rule {} redirects to step {}", rule.rule_id, target)
            }
            ActionType::AbortRun => {
                let reason = reason_or(&action.reason, || format!("aborted by rule {}", rule.rule_id));
                state.fail(reason.clone());
                format!("Rule {} aborted the run: {}", rule.rule_id, reason)
            }
            ActionType::Escalate => {
                let reason =
                    reason_or(&action.reason, || format!("escalated by rule {}", rule.rule_id));
                state.block(reason.clone(), step.step_id.clone());
                format!("Rule {} escalated: {}", rule.rule_id, reason)
            }
        };

        log.append(
            &Event::new(
                &state.run_id,
                Some(step.step_id.clone()),
                EventType::RouteApplied,
                summary,
            )
            .with_attempt(outcome.attempt),
        )
        .await?;

        if action.action_type == ActionType::RetryStep {
            tokio::time::sleep(step.retry_policy.delay_for_attempt(outcome.attempt)).await;
        }

        Ok(())
    }

    async fn apply_default_policy(
        &self,
        log: &RunLog,
        step: &StepSpec,
        outcome: &StepOutcome,
        state: &mut RunState,
        redirect: &mut Option<String>,
    ) -> Result<()> {
        if outcome.step_status == StepStatus::Succeeded {
            return Ok(());
        }

        let last_error = state
            .record(&step.step_id)
            .and_then(|r| r.last_error.clone())
            .unwrap_or_default();

        if outcome.gate_status == Some(GateStatus::Failed) {
            state.fail(format!("step {}: {}", step.step_id, last_error));
            return Ok(());
        }

        if outcome.retry_exhausted {
            state.fail(format!(
                "step {} failed after {} attempt(s): {}",
                step.step_id, outcome.attempt, last_error
            ));
            return Ok(());
        }

        let delay = step.retry_policy.delay_for_attempt(outcome.attempt);
        debug!(step = %step.step_id, attempt = outcome.attempt, ?delay, "Retrying step");
        state.record_mut(&step.step_id).status = StepStatus::Pending;
        *redirect = Some(step.step_id.clone());

        log.append(
            &Event::new(
                &state.run_id,
                Some(step.step_id.clone()),
                EventType::StepRetrying,
                format!(
                    "Retrying step {} ({}/{} retries)",
                    step.step_id, outcome.attempt, step.retry_policy.max_retries
                ),
            )
            .with_attempt(outcome.attempt)
            .with_error(last_error),
        )
        .await?;

        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Stamp completion, log the terminal event and persist the state
    async fn finish_run(&self, log: &RunLog, state: &mut RunState, run_root: &Path) -> Result<()> {
        state.completed_at = Some(Utc::now());

        let (event_type, summary) = match state.status {
            RunStatus::Succeeded => {
                info!(run_id = %state.run_id, "Run succeeded");
                (EventType::RunSucceeded, "Run succeeded".to_string())
            }
            RunStatus::Blocked => {
                let reason = state.escalation_reason.clone().unwrap_or_default();
                warn!(run_id = %state.run_id, %reason, "Run blocked");
                (EventType::RunBlocked, format!("Run blocked: {}", reason))
            }
            RunStatus::Failed | RunStatus::Running => {
                let reason = state.failure_reason.clone().unwrap_or_default();
                error!(run_id = %state.run_id, %reason, "Run failed");
                (EventType::RunFailed, format!("Run failed: {}", reason))
            }
        };

        let mut event = Event::new(&state.run_id, None, event_type, summary);
        if let Some(ref reason) = state.failure_reason {
            event = event.with_error(reason.clone());
        }
        log.append(&event).await?;

        let path = state.save(run_root)?;
        debug!(path = %path.display(), "Run state saved");
        Ok(())
    }
}

/// First pending step in scheduling order whose dependencies all succeeded
fn next_eligible(order: &[String], graph: &GraphSpec, state: &RunState) -> Option<String> {
    order
        .iter()
        .find(|step_id| {
            state.step_status(step_id) == StepStatus::Pending
                && graph.step(step_id).is_some_and(|step| {
                    step.depends_on
                        .iter()
                        .all(|dep| state.step_status(dep) == StepStatus::Succeeded)
                })
        })
        .cloned()
}

fn reason_or(reason: &str, fallback: impl FnOnce() -> String) -> String {
    if reason.trim().is_empty() {
        fallback()
    } else {
        reason.to_string()
    }
}
