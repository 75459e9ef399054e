//! Core kernel logic.
//!
//! This module contains:
//! - GraphRunner: the run state machine
//! - GateEngine / RoutingEngine: post-step validation and recovery rules
//! - ArtifactStore / ArtifactIndex: durable artifacts and the shared index
//! - Registries and pack composition
//! - Safety: merged safety policies
//! - RunLog: append-only run event log

pub mod artifact_store;
pub mod gates;
pub mod index;
pub mod pack;
pub mod registry;
pub mod routing;
pub mod run_log;
pub mod runner;
pub mod safety;

// Re-export commonly used types
pub use artifact_store::{ArtifactStore, StoreError, StoredPayload};
pub use gates::{GateEngine, GateEvaluation, GateResult, GATE_RESULT_ARTIFACT};
pub use index::{ArtifactIndex, ArtifactQuery};
pub use pack::{KernelConfig, LoadedPack, KERNEL_VERSION};
pub use registry::{merge_routing_rules, RegistryError, SchemaRegistry, TemplateRegistry};
pub use routing::RoutingEngine;
pub use run_log::RunLog;
pub use runner::{GraphRunner, RunLimits, STEP_ATTEMPT_ARTIFACT};
pub use safety::{merge_pack_safety_policies, NetworkAccess, SafetyPolicy, SafetyViolation};
