//! Graph definitions: steps, gates, and the policies attached to them.
//!
//! A `GraphSpec` is authored in YAML or JSON (or expanded from pack
//! templates) and is immutable once a run starts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::routing::{ActionType, RoutingRule};

/// The only executor kind the kernel knows how to run.
pub const LOCAL_COMMAND: &str = "local_command";

/// A complete graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Graph identifier
    pub graph_id: String,

    /// Steps in declaration order
    pub steps: Vec<StepSpec>,

    /// Graph-local routing rules, evaluated before any pack rules
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
}

impl GraphSpec {
    /// Load a graph from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph file: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a graph from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse graph YAML")
    }

    /// Parse a graph from JSON content
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse graph JSON")
    }

    /// Get a step by id
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Validate the graph definition.
    ///
    /// Checks ids, dependencies, cycles, gate ids, executor kinds, and that
    /// every GOTO target in `routing_rules` names a step.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.graph_id.trim().is_empty() {
            return Err(GraphError::EmptyGraphId);
        }
        if self.steps.is_empty() {
            return Err(GraphError::NoSteps {
                graph_id: self.graph_id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(GraphError::EmptyStepId);
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(GraphError::DuplicateStep {
                    step_id: step.step_id.clone(),
                });
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if step.executor.kind != LOCAL_COMMAND {
                return Err(GraphError::UnsupportedExecutorKind {
                    owner: step.step_id.clone(),
                    kind: step.executor.kind.clone(),
                });
            }

            // The same gate may be declared more than once; each runs
            for gate in &step.gates {
                if gate.gate_id.trim().is_empty() {
                    return Err(GraphError::EmptyGateId {
                        step_id: step.step_id.clone(),
                    });
                }
                if gate.runner.kind != LOCAL_COMMAND {
                    return Err(GraphError::UnsupportedExecutorKind {
                        owner: format!("{}/{}", step.step_id, gate.gate_id),
                        kind: gate.runner.kind.clone(),
                    });
                }
            }
        }

        self.validate_rule_targets(&self.routing_rules)?;
        self.topological_order()?;

        Ok(())
    }

    /// Check that every rule target in `rules` names a step of this graph.
    ///
    /// GOTO_STEP must name a target; RETRY_STEP may.
    pub fn validate_rule_targets(&self, rules: &[RoutingRule]) -> Result<(), GraphError> {
        for rule in rules {
            let target = rule.action.target_step_id.as_deref();
            if target.is_none() && rule.action.action_type != ActionType::GotoStep {
                continue;
            }
            match target {
                Some(target) if self.step(target).is_some() => {}
                target => {
                    return Err(GraphError::UnknownRuleTarget {
                        rule_id: rule.rule_id.clone(),
                        target: target.unwrap_or_default().to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Deterministic scheduling order.
    ///
    /// Kahn's algorithm; among ready steps the lexicographically smallest
    /// `step_id` goes first.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(step.step_id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                *in_degree.entry(step.step_id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.step_id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for child in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if order.len() != in_degree.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(id, _)| !order.iter().any(|o| o == *id))
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(GraphError::Cycle { steps: stuck });
        }

        Ok(order)
    }
}

/// A single unit of work in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id (unique within graph)
    pub step_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Steps that must have succeeded before this one is eligible
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Artifact ids recorded as lineage inputs of every attempt
    #[serde(default)]
    pub input_artifact_ids: Vec<String>,

    #[serde(default)]
    pub output_schema_ids: Vec<String>,

    /// Command to run for this step
    pub executor: ExecutorSpec,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Post-success checks, run in declaration order
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

impl StepSpec {
    /// Create a step running `argv` with default policies
    pub fn new(step_id: impl Into<String>, argv: Vec<String>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            description: String::new(),
            depends_on: Vec::new(),
            input_artifact_ids: Vec::new(),
            output_schema_ids: Vec::new(),
            executor: ExecutorSpec::local(argv),
            retry_policy: RetryPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            gates: Vec::new(),
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy.max_retries = max_retries;
        self
    }

    /// Get the effective timeout for this step
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_policy
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// A post-success validation check attached to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub gate_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Artifact ids recorded as lineage inputs of the gate result
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Gate must run inside the runner's workspace directory
    #[serde(default)]
    pub workspace_required: bool,

    pub runner: GateRunnerSpec,

    /// A failing required gate fails the step
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl GateSpec {
    /// Create a required gate running `argv`
    pub fn new(gate_id: impl Into<String>, argv: Vec<String>) -> Self {
        let gate_id = gate_id.into();
        Self {
            name: gate_id.clone(),
            gate_id,
            description: String::new(),
            inputs: Vec::new(),
            workspace_required: false,
            runner: ExecutorSpec::local(argv),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// What to run and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Executor kind (only `local_command` is supported)
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Program and arguments
    pub argv: Vec<String>,
}

/// Gates are run through the same executor boundary as steps
pub type GateRunnerSpec = ExecutorSpec;

fn default_kind() -> String {
    LOCAL_COMMAND.to_string()
}

impl ExecutorSpec {
    pub fn local(argv: Vec<String>) -> Self {
        Self {
            kind: default_kind(),
            argv,
        }
    }
}

/// Retry policy for failed executor attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    #[serde(default)]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default)]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// True once `attempts` executor attempts have used up every retry
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_retries
    }
}

/// Per-invocation time limit for a step and its gates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Overrides the runner's default step timeout when set
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Graph validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph id cannot be empty")]
    EmptyGraphId,

    #[error("graph '{graph_id}' has no steps")]
    NoSteps { graph_id: String },

    #[error("step id cannot be empty")]
    EmptyStepId,

    #[error("duplicate step id '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("dependency cycle among steps: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("step '{step_id}' declares a gate without an id")]
    EmptyGateId { step_id: String },

    #[error("rule '{rule_id}' routes to unknown step '{target}'")]
    UnknownRuleTarget { rule_id: String, target: String },

    #[error("unsupported executor kind '{kind}' on '{owner}'")]
    UnsupportedExecutorKind { owner: String, kind: String },
}
