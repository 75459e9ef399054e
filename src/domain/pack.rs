//! Pack definitions: the only accepted format for external composition.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::routing::RoutingRule;
use super::template::{GateTemplate, StepTemplate};
use crate::core::registry::{validate_namespaced_id, RegistryError};
use crate::core::safety::SafetyPolicy;

/// An externally authored bundle contributed to the kernel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackDefinition {
    pub name: String,

    pub version: String,

    /// Lowest kernel version this pack works with (`major.minor.patch`)
    #[serde(default = "default_minimum_kernel_version")]
    pub minimum_kernel_version: String,

    #[serde(default)]
    pub schemas: Vec<SchemaRegistration>,

    #[serde(default)]
    pub step_templates: Vec<StepTemplate>,

    #[serde(default)]
    pub gate_templates: Vec<GateTemplate>,

    /// Rules in priority order within this pack
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,

    #[serde(default)]
    pub default_safety_policy: Option<SafetyPolicy>,
}

fn default_minimum_kernel_version() -> String {
    "0.0.0".to_string()
}

impl PackDefinition {
    /// Create an empty pack
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            minimum_kernel_version: default_minimum_kernel_version(),
            schemas: Vec::new(),
            step_templates: Vec::new(),
            gate_templates: Vec::new(),
            routing_rules: Vec::new(),
            default_safety_policy: None,
        }
    }

    /// Load a pack from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pack file: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse pack JSON: {}", path.display())),
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse pack YAML: {}", path.display())),
        }
    }

    /// Check name, version and that every contributed id is namespaced
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidPack("pack name is empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(RegistryError::InvalidPack(format!(
                "pack '{}' has no version",
                self.name
            )));
        }

        let schema_ids = self.schemas.iter().map(|s| s.schema_id.as_str());
        let step_ids = self.step_templates.iter().map(|t| t.template_id.as_str());
        let gate_ids = self.gate_templates.iter().map(|t| t.template_id.as_str());
        for id in schema_ids.chain(step_ids).chain(gate_ids) {
            validate_namespaced_id(id)?;
        }

        if let Some(rule) = self.routing_rules.iter().find(|r| r.rule_id.trim().is_empty()) {
            return Err(RegistryError::InvalidPack(format!(
                "pack '{}' has a routing rule without an id (action {:?})",
                self.name, rule.action.action_type
            )));
        }

        Ok(())
    }
}

/// A schema contributed by a pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistration {
    /// Namespaced id (e.g. `ci.test_report`)
    pub schema_id: String,

    /// JSON Schema document describing valid payloads
    pub model: Value,
}
