//! Composition of packs into a kernel configuration.
//!
//! `KernelConfig::from_packs` is the only way pack contributions reach the
//! kernel. Packs are applied in load order and the first error aborts the
//! whole composition.

use std::sync::Arc;

use tracing::{debug, info};

use super::registry::{merge_routing_rules, RegistryError, SchemaRegistry, TemplateRegistry};
use super::safety::{merge_pack_safety_policies, SafetyPolicy};
use crate::domain::{PackDefinition, RoutingRule};

/// Version of this kernel, compared against `minimum_kernel_version`
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A loaded pack, as reported by `KernelConfig::packs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPack {
    pub name: String,
    pub version: String,
}

/// Everything the kernel needs from a set of packs
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub templates: TemplateRegistry,
    pub schemas: Arc<SchemaRegistry>,
    /// Merged rules in pack load order
    pub routing_rules: Vec<RoutingRule>,
    /// Merged default safety policy, if any pack contributed one
    pub safety_policy: Option<SafetyPolicy>,
    pub packs: Vec<LoadedPack>,
}

impl KernelConfig {
    /// Compose packs in load order
    pub fn from_packs(packs: &[PackDefinition]) -> Result<Self, RegistryError> {
        let current = parse_version(KERNEL_VERSION)?;

        let mut templates = TemplateRegistry::new();
        let mut schemas = SchemaRegistry::new();

        for pack in packs {
            pack.validate()?;

            let required = parse_version(&pack.minimum_kernel_version)?;
            if required > current {
                return Err(RegistryError::KernelTooOld {
                    pack: pack.name.clone(),
                    required: pack.minimum_kernel_version.clone(),
                    current: KERNEL_VERSION.to_string(),
                });
            }

            schemas.register_pack_schemas(pack)?;
            for template in &pack.gate_templates {
                templates.register_gate_template(template.clone())?;
            }
            for template in &pack.step_templates {
                templates.register_step_template(template.clone())?;
            }

            debug!(
                pack = %pack.name,
                schemas = pack.schemas.len(),
                step_templates = pack.step_templates.len(),
                gate_templates = pack.gate_templates.len(),
                "Registered pack"
            );
        }

        let routing_rules = merge_routing_rules(
            packs
                .iter()
                .map(|p| (p.name.as_str(), p.routing_rules.as_slice())),
        )?;

        let safety_policy =
            merge_pack_safety_policies(packs.iter().filter_map(|p| p.default_safety_policy.as_ref()));

        let loaded: Vec<LoadedPack> = packs
            .iter()
            .map(|p| LoadedPack {
                name: p.name.clone(),
                version: p.version.clone(),
            })
            .collect();

        info!(
            packs = loaded.len(),
            rules = routing_rules.len(),
            "Kernel configuration composed"
        );

        Ok(Self {
            templates,
            schemas: Arc::new(schemas),
            routing_rules,
            safety_policy,
            packs: loaded,
        })
    }
}

/// Parse a dotted numeric `major.minor.patch` version.
///
/// Missing trailing components count as zero and pre-release suffixes
/// (`1.2.0-beta`) are ignored.
pub fn parse_version(version: &str) -> Result<(u64, u64, u64), RegistryError> {
    let invalid = || RegistryError::InvalidVersion(version.to_string());

    let core = version.trim().split(['-', '+']).next().unwrap_or_default();
    if core.is_empty() {
        return Err(invalid());
    }

    let mut parts = [0u64; 3];
    for (i, part) in core.split('.').enumerate() {
        if i >= parts.len() {
            return Err(invalid());
        }
        parts[i] = part.parse().map_err(|_| invalid())?;
    }

    Ok((parts[0], parts[1], parts[2]))
}
