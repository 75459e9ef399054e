//! Domain types for the kernel.
//!
//! This module contains the core data structures:
//! - Graph: steps, gates, executor and retry/timeout policies
//! - Routing: rule conditions and actions
//! - Run: run state and per-step records
//! - Artifact: artifact references and envelopes
//! - Events: run log entries
//! - Template/Pack: composition inputs

pub mod artifact;
pub mod events;
pub mod graph;
pub mod pack;
pub mod routing;
pub mod run;
pub mod template;

// Re-export commonly used types
pub use artifact::{
    canonical_json, payload_sha256, ArtifactRef, ArtifactSpec, Envelope, EnvelopeMeta,
    ProducerKind, StorageKind,
};
pub use events::{Event, EventType};
pub use graph::{
    ExecutorSpec, GateRunnerSpec, GateSpec, GraphError, GraphSpec, RetryPolicy, StepSpec,
    TimeoutPolicy, LOCAL_COMMAND,
};
pub use pack::{PackDefinition, SchemaRegistration};
pub use routing::{
    ActionType, GateStatus, RoutingAction, RoutingCondition, RoutingRule, StepOutcome,
};
pub use run::{RunState, RunStatus, StepRunRecord, StepStatus};
pub use template::{
    GateOverrides, GateTemplate, GraphDocument, StepEntry, StepOverrides, StepTemplate,
    TemplateStep,
};
