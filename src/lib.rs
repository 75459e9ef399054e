//! stepkernel - deterministic step/gate execution kernel
//!
//! Runs a DAG of command steps with post-success gates and declarative
//! routing rules for recovery, backed by a durable artifact store and a
//! workspace-wide SQLite lineage index.
//!
//! # Architecture
//!
//! - Each run owns a directory (`logs/`, `artifacts/`, `tmp/`) and an
//!   append-only event log
//! - Artifacts are written durably before they are indexed
//! - Packs contribute templates, schemas, routing rules and safety policy;
//!   collisions are errors, never overrides
//!
//! # Modules
//!
//! - `adapters`: Executors (`local_command`)
//! - `core`: GraphRunner, gates, routing, artifact store, registries
//! - `domain`: Data structures (GraphSpec, RunState, ArtifactRef, Event)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a graph with two packs loaded
//! stepkernel run graph.yaml --pack rust.yaml --pack ci.yaml
//!
//! # Inspect a finished run
//! stepkernel status ~/.stepkernel/runs/<run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{ExecOutput, ExecRequest, Executor, ExecutorError, LocalCommandExecutor};
pub use core::{ArtifactIndex, ArtifactStore, GraphRunner, KernelConfig, RunLimits};
pub use domain::{GraphSpec, PackDefinition, RunState, RunStatus, StepStatus};
