//! Reusable step and gate templates.
//!
//! Templates are never executed directly: they are expanded into concrete
//! `StepSpec`/`GateSpec` values with per-use overrides. Graph files name a
//! template with a `template:` step entry; see `GraphDocument`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::graph::{ExecutorSpec, GateRunnerSpec, RetryPolicy, StepSpec, TimeoutPolicy};
use super::routing::RoutingRule;

/// Template for a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Namespaced id (e.g. `rust.cargo_test`)
    pub template_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub executor: ExecutorSpec,

    #[serde(default)]
    pub output_schema_ids: Vec<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Gate templates attached to every expansion, in order
    #[serde(default)]
    pub gate_template_ids: Vec<String>,
}

/// Template for a gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateTemplate {
    /// Namespaced id (e.g. `rust.clippy`)
    pub template_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub workspace_required: bool,

    pub runner: GateRunnerSpec,

    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Per-use values applied when expanding a step template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOverrides {
    /// Id of the expanded step (required)
    pub step_id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub input_artifact_ids: Vec<String>,

    /// Replaces the template's argv
    #[serde(default)]
    pub argv: Option<Vec<String>>,

    /// Appended to the (possibly replaced) argv
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub timeout_policy: Option<TimeoutPolicy>,

    /// Gate overrides keyed by gate template id
    #[serde(default)]
    pub gates: Vec<GateOverrides>,
}

impl StepOverrides {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}

/// Per-use values applied when expanding a gate template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateOverrides {
    /// Id of the expanded gate; defaults to the template id
    #[serde(default)]
    pub gate_id: Option<String>,

    /// Which template these overrides apply to when nested in a step
    #[serde(default)]
    pub template_id: Option<String>,

    #[serde(default)]
    pub required: Option<bool>,

    #[serde(default)]
    pub inputs: Option<Vec<String>>,

    #[serde(default)]
    pub argv: Option<Vec<String>>,
}

/// A graph file as authored, before template expansion.
///
/// Each step is either a full inline step or a template reference:
///
/// ```yaml
/// steps:
///   - template: rust.cargo_test
///     step_id: unit
///     extra_args: [--lib]
///   - step_id: docs
///     executor:
///       argv: [cargo, doc]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub graph_id: String,

    pub steps: Vec<StepEntry>,

    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
}

/// One step entry of a graph file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Template(TemplateStep),
    Inline(StepSpec),
}

/// A step expanded from a registered step template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    /// Step template id
    pub template: String,

    #[serde(flatten)]
    pub overrides: StepOverrides,
}

impl GraphDocument {
    /// Load a graph file from YAML or JSON (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph file: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse graph JSON: {}", path.display())),
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse graph YAML: {}", path.display())),
        }
    }

    /// Template ids referenced by this document, in step order
    pub fn template_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|entry| match entry {
            StepEntry::Template(step) => Some(step.template.as_str()),
            StepEntry::Inline(_) => None,
        })
    }
}
