//! Collision-safe registries for templates, schemas, and routing rules.
//!
//! Every insert rejects an id that is already present. Nothing is ever
//! silently overridden, and a failed registration leaves the registry
//! unchanged.

use std::collections::{BTreeMap, HashSet};

use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    GateOverrides, GateSpec, GateTemplate, GraphDocument, GraphSpec, PackDefinition,
    RoutingRule, StepEntry, StepOverrides, StepSpec, StepTemplate,
};

/// Characters accepted as namespace separators in template and schema ids
const NAMESPACE_SEPARATORS: [char; 3] = ['.', ':', '/'];

/// Registration and composition errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("step template '{0}' is already registered")]
    DuplicateStepTemplate(String),

    #[error("gate template '{0}' is already registered")]
    DuplicateGateTemplate(String),

    #[error("schema '{schema_id}' registered by pack '{existing_pack}' and again by pack '{new_pack}'")]
    DuplicateSchema {
        schema_id: String,
        existing_pack: String,
        new_pack: String,
    },

    #[error("routing rule '{rule_id}' is defined more than once (second definition from '{source_name}')")]
    DuplicateRule { rule_id: String, source_name: String },

    #[error("id '{0}' is not namespaced (expected e.g. 'pack.name')")]
    NotNamespaced(String),

    #[error("unknown step template '{0}'")]
    UnknownStepTemplate(String),

    #[error("unknown gate template '{0}'")]
    UnknownGateTemplate(String),

    #[error("unknown schema '{0}'")]
    UnknownSchema(String),

    #[error("schema '{schema_id}' model is invalid: {details}")]
    InvalidSchemaModel { schema_id: String, details: String },

    #[error("payload does not match schema '{schema_id}': {details}")]
    SchemaViolation { schema_id: String, details: String },

    #[error("step override is missing a step_id for template '{0}'")]
    MissingStepId(String),

    #[error("pack '{pack}' requires kernel >= {required}, running {current}")]
    KernelTooOld {
        pack: String,
        required: String,
        current: String,
    },

    #[error("invalid version '{0}' (expected major.minor.patch)")]
    InvalidVersion(String),

    #[error("pack definition is invalid: {0}")]
    InvalidPack(String),
}

/// Check that an id has a non-empty namespace and a non-empty local part
pub fn validate_namespaced_id(id: &str) -> Result<(), RegistryError> {
    match id.split_once(NAMESPACE_SEPARATORS) {
        Some((namespace, local)) if !namespace.trim().is_empty() && !local.trim().is_empty() => {
            Ok(())
        }
        _ => Err(RegistryError::NotNamespaced(id.to_string())),
    }
}

/// Step and gate templates keyed by namespaced id
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    step_templates: BTreeMap<String, StepTemplate>,
    gate_templates: BTreeMap<String, GateTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step template; a taken id is an error
    pub fn register_step_template(&mut self, template: StepTemplate) -> Result<(), RegistryError> {
        validate_namespaced_id(&template.template_id)?;
        if self.step_templates.contains_key(&template.template_id) {
            return Err(RegistryError::DuplicateStepTemplate(template.template_id));
        }
        self.step_templates
            .insert(template.template_id.clone(), template);
        Ok(())
    }

    /// Register a gate template; a taken id is an error
    pub fn register_gate_template(&mut self, template: GateTemplate) -> Result<(), RegistryError> {
        validate_namespaced_id(&template.template_id)?;
        if self.gate_templates.contains_key(&template.template_id) {
            return Err(RegistryError::DuplicateGateTemplate(template.template_id));
        }
        self.gate_templates
            .insert(template.template_id.clone(), template);
        Ok(())
    }

    pub fn step_template(&self, template_id: &str) -> Option<&StepTemplate> {
        self.step_templates.get(template_id)
    }

    pub fn gate_template(&self, template_id: &str) -> Option<&GateTemplate> {
        self.gate_templates.get(template_id)
    }

    pub fn step_template_ids(&self) -> impl Iterator<Item = &str> {
        self.step_templates.keys().map(String::as_str)
    }

    pub fn gate_template_ids(&self) -> impl Iterator<Item = &str> {
        self.gate_templates.keys().map(String::as_str)
    }

    /// Instantiate a concrete gate from a template
    pub fn expand_gate_template(
        &self,
        template_id: &str,
        overrides: &GateOverrides,
    ) -> Result<GateSpec, RegistryError> {
        let template = self
            .gate_template(template_id)
            .ok_or_else(|| RegistryError::UnknownGateTemplate(template_id.to_string()))?;

        let mut runner = template.runner.clone();
        if let Some(ref argv) = overrides.argv {
            runner.argv = argv.clone();
        }

        Ok(GateSpec {
            gate_id: overrides
                .gate_id
                .clone()
                .unwrap_or_else(|| template.template_id.clone()),
            name: if template.name.is_empty() {
                template.template_id.clone()
            } else {
                template.name.clone()
            },
            description: template.description.clone(),
            inputs: overrides
                .inputs
                .clone()
                .unwrap_or_else(|| template.inputs.clone()),
            workspace_required: template.workspace_required,
            runner,
            required: overrides.required.unwrap_or(template.required),
        })
    }

    /// Expand every template step of a graph file, keeping step order
    pub fn expand_graph(&self, document: &GraphDocument) -> Result<GraphSpec, RegistryError> {
        let steps = document
            .steps
            .iter()
            .map(|entry| match entry {
                StepEntry::Inline(step) => Ok(step.clone()),
                StepEntry::Template(step) => {
                    self.expand_step_template(&step.template, &step.overrides)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GraphSpec {
            graph_id: document.graph_id.clone(),
            steps,
            routing_rules: document.routing_rules.clone(),
        })
    }

    /// Instantiate a concrete step (and its template gates) from a template
    pub fn expand_step_template(
        &self,
        template_id: &str,
        overrides: &StepOverrides,
    ) -> Result<StepSpec, RegistryError> {
        let template = self
            .step_template(template_id)
            .ok_or_else(|| RegistryError::UnknownStepTemplate(template_id.to_string()))?;

        if overrides.step_id.trim().is_empty() {
            return Err(RegistryError::MissingStepId(template_id.to_string()));
        }

        let mut executor = template.executor.clone();
        if let Some(ref argv) = overrides.argv {
            executor.argv = argv.clone();
        }
        executor.argv.extend(overrides.extra_args.iter().cloned());

        let default_gate_overrides = GateOverrides::default();
        let gates = template
            .gate_template_ids
            .iter()
            .map(|gate_template_id| {
                let gate_overrides = overrides
                    .gates
                    .iter()
                    .find(|g| g.template_id.as_deref() == Some(gate_template_id.as_str()))
                    .unwrap_or(&default_gate_overrides);
                self.expand_gate_template(gate_template_id, gate_overrides)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StepSpec {
            step_id: overrides.step_id.clone(),
            name: overrides
                .name
                .clone()
                .or_else(|| (!template.name.is_empty()).then(|| template.name.clone()))
                .unwrap_or_else(|| overrides.step_id.clone()),
            description: overrides
                .description
                .clone()
                .unwrap_or_else(|| template.description.clone()),
            depends_on: overrides.depends_on.clone(),
            input_artifact_ids: overrides.input_artifact_ids.clone(),
            output_schema_ids: template.output_schema_ids.clone(),
            executor,
            retry_policy: overrides
                .retry_policy
                .clone()
                .unwrap_or_else(|| template.retry_policy.clone()),
            timeout_policy: overrides
                .timeout_policy
                .clone()
                .unwrap_or_else(|| template.timeout_policy.clone()),
            gates,
        })
    }
}

#[derive(Debug, Clone)]
struct RegisteredSchema {
    pack: String,
    model: Value,
}

/// Schemas contributed by packs, keyed by namespaced id
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, RegisteredSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every schema of a pack.
    ///
    /// All ids are checked before anything is inserted, so a rejected pack
    /// contributes nothing.
    pub fn register_pack_schemas(&mut self, pack: &PackDefinition) -> Result<(), RegistryError> {
        let mut in_pack = HashSet::new();
        for registration in &pack.schemas {
            validate_namespaced_id(&registration.schema_id)?;
            if let Some(existing) = self.schemas.get(&registration.schema_id) {
                return Err(RegistryError::DuplicateSchema {
                    schema_id: registration.schema_id.clone(),
                    existing_pack: existing.pack.clone(),
                    new_pack: pack.name.clone(),
                });
            }
            if !in_pack.insert(registration.schema_id.as_str()) {
                return Err(RegistryError::DuplicateSchema {
                    schema_id: registration.schema_id.clone(),
                    existing_pack: pack.name.clone(),
                    new_pack: pack.name.clone(),
                });
            }
            JSONSchema::compile(&registration.model).map_err(|e| {
                RegistryError::InvalidSchemaModel {
                    schema_id: registration.schema_id.clone(),
                    details: e.to_string(),
                }
            })?;
        }

        for registration in &pack.schemas {
            self.schemas.insert(
                registration.schema_id.clone(),
                RegisteredSchema {
                    pack: pack.name.clone(),
                    model: registration.model.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.schemas.contains_key(schema_id)
    }

    /// Name of the pack that contributed a schema
    pub fn owner(&self, schema_id: &str) -> Option<&str> {
        self.schemas.get(schema_id).map(|s| s.pack.as_str())
    }

    pub fn model(&self, schema_id: &str) -> Option<&Value> {
        self.schemas.get(schema_id).map(|s| &s.model)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validate a payload against a registered schema model
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Result<(), RegistryError> {
        let model = self
            .model(schema_id)
            .ok_or_else(|| RegistryError::UnknownSchema(schema_id.to_string()))?;

        let compiled =
            JSONSchema::compile(model).map_err(|e| RegistryError::InvalidSchemaModel {
                schema_id: schema_id.to_string(),
                details: e.to_string(),
            })?;

        if let Err(errors) = compiled.validate(payload) {
            let details: Vec<String> = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect();
            return Err(RegistryError::SchemaViolation {
                schema_id: schema_id.to_string(),
                details: details.join("; "),
            });
        }

        Ok(())
    }
}

/// Concatenate rule lists in load order, rejecting duplicate rule ids.
///
/// Each source is `(name, rules)`; the name only appears in errors.
/// Load order fixes first-match priority.
pub fn merge_routing_rules<'a>(
    sources: impl IntoIterator<Item = (&'a str, &'a [RoutingRule])>,
) -> Result<Vec<RoutingRule>, RegistryError> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for (source_name, rules) in sources {
        for rule in rules {
            if !seen.insert(rule.rule_id.clone()) {
                return Err(RegistryError::DuplicateRule {
                    rule_id: rule.rule_id.clone(),
                    source_name: source_name.to_string(),
                });
            }
            merged.push(rule.clone());
        }
    }

    Ok(merged)
}
