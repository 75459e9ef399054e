//! Command-line interface for stepkernel.
//!
//! Provides commands for running graphs, inspecting finished runs,
//! querying the artifact index, and showing resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::LocalCommandExecutor;
use crate::config::{self, paths};
use crate::core::{
    ArtifactIndex, ArtifactQuery, GraphRunner, KernelConfig, RunLimits, RunLog, SafetyPolicy,
};
use crate::domain::{ArtifactRef, GraphDocument, PackDefinition, RunState, RunStatus};

/// stepkernel - deterministic step/gate execution kernel
#[derive(Parser, Debug)]
#[command(name = "stepkernel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a graph
    Run {
        /// Graph file (YAML or JSON); steps may reference pack templates
        graph_file: PathBuf,

        /// Run directory (defaults to <runs>/<run-id>)
        #[arg(long)]
        run_root: Option<PathBuf>,

        /// Pack file to load, in load order (repeatable)
        #[arg(long = "pack")]
        packs: Vec<PathBuf>,

        /// Working directory for steps and gates
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Show the persisted state of a run
    Status {
        /// Run directory
        run_root: PathBuf,
    },

    /// Query the artifact index
    Artifacts {
        #[arg(long)]
        run_id: Option<String>,

        /// Artifact type (e.g. step_attempt, gate_result)
        #[arg(long = "type")]
        artifact_type: Option<String>,

        #[arg(long)]
        producer: Option<String>,
    },

    /// Show the transitive inputs of an artifact
    Lineage {
        artifact_id: String,
    },

    /// Print the event log of a run
    Events {
        /// Run directory
        run_root: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                graph_file,
                run_root,
                packs,
                workspace,
            } => run_graph(&graph_file, run_root, &packs, workspace).await,
            Commands::Status { run_root } => show_status(&run_root),
            Commands::Artifacts {
                run_id,
                artifact_type,
                producer,
            } => list_artifacts(ArtifactQuery {
                run_id,
                artifact_type,
                producer_id: producer,
            }),
            Commands::Lineage { artifact_id } => show_lineage(&artifact_id),
            Commands::Events { run_root } => show_events(&run_root).await,
            Commands::Config => show_config(),
        }
    }
}

/// Load packs, expand the graph, run it with the local executor, print a summary
async fn run_graph(
    graph_file: &Path,
    run_root: Option<PathBuf>,
    pack_files: &[PathBuf],
    workspace: Option<PathBuf>,
) -> Result<()> {
    let packs = pack_files
        .iter()
        .map(|path| PackDefinition::from_file(path))
        .collect::<Result<Vec<_>>>()?;
    let kernel = KernelConfig::from_packs(&packs).context("Failed to compose packs")?;

    let document = GraphDocument::from_file(graph_file)?;
    let graph = kernel
        .templates
        .expand_graph(&document)
        .with_context(|| format!("Failed to expand graph '{}'", document.graph_id))?;

    let cfg = config::config()?;
    let run_id = Uuid::new_v4().to_string();
    let run_root = match run_root {
        Some(root) => root,
        None => paths::run_root(&run_id)?,
    };

    let index = ArtifactIndex::open(&cfg.index)
        .with_context(|| format!("Failed to open artifact index: {}", cfg.index.display()))?;
    let mut runner = GraphRunner::new(Arc::new(LocalCommandExecutor::new()), index)
        .with_limits(RunLimits::from(&cfg.limits))
        .with_schemas(Arc::clone(&kernel.schemas))
        .with_routing_rules(kernel.routing_rules.clone());
    if let Some(workspace) = workspace {
        runner = runner.with_workspace(workspace);
    }

    let state = runner.run_graph_with_id(&run_id, &run_root, &graph).await?;

    print_state(&state);
    print_packs(&kernel);
    eprintln!("\n[Run {} at {}]", state.run_id, run_root.display());

    if state.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the persisted state of a run
fn show_status(run_root: &Path) -> Result<()> {
    let state = RunState::load(run_root)?;
    print_state(&state);
    Ok(())
}

fn print_state(state: &RunState) {
    println!("Run ID: {}", state.run_id);
    println!("Graph: {}", state.graph_id);
    println!("Status: {}", state.status);
    println!("Started: {}", state.started_at);
    if let Some(completed) = state.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref reason) = state.failure_reason {
        println!("Failure: {}", reason);
    }
    if let Some(ref reason) = state.escalation_reason {
        println!(
            "Escalated at {}: {}",
            state.escalation_step_id.as_deref().unwrap_or("?"),
            reason
        );
    }

    println!("\nSteps:");
    println!("  {:<24} {:<10} {:<9} {:<6} LAST ERROR", "STEP", "STATUS", "ATTEMPTS", "GATES");
    for (step_id, record) in &state.step_records {
        println!(
            "  {:<24} {:<10} {:<9} {:<6} {}",
            step_id,
            record.status.to_string(),
            record.attempt_count,
            record.gate_results.len(),
            record.last_error.as_deref().unwrap_or("-")
        );
    }
}

fn print_packs(kernel: &KernelConfig) {
    if kernel.packs.is_empty() {
        return;
    }

    println!("\nPacks:");
    for pack in &kernel.packs {
        println!("  {} {}", pack.name, pack.version);
    }

    if let Some(ref policy) = kernel.safety_policy {
        print_safety_policy(policy);
    }
}

/// Show the merged safety policy of the loaded packs
fn print_safety_policy(policy: &SafetyPolicy) {
    fn list(items: &[String]) -> String {
        if items.is_empty() {
            "(none)".to_string()
        } else {
            items.join(", ")
        }
    }

    println!("\nSafety policy:");
    println!("  Allowed writes: {}", list(&policy.allow_write_paths));
    println!("  Denied writes:  {}", list(&policy.deny_write_paths));
    println!("  Allowed tools:  {}", list(&policy.allowed_tools));
    println!(
        "  Max diff size:  {}",
        policy
            .max_diff_size_bytes
            .map(|b| format!("{} bytes", b))
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!("  Network:        {:?}", policy.network_access);
}

/// Query the artifact index
fn list_artifacts(query: ArtifactQuery) -> Result<()> {
    let index = ArtifactIndex::open_default()?;
    let artifacts = index.list(&query)?;

    if artifacts.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    print_artifact_header();
    for artifact in &artifacts {
        print_artifact(artifact);
    }

    Ok(())
}

/// Show the transitive inputs of an artifact
fn show_lineage(artifact_id: &str) -> Result<()> {
    let index = ArtifactIndex::open_default()?;
    let root = index
        .get(artifact_id)?
        .with_context(|| format!("Artifact not found in index: {}", artifact_id))?;
    let lineage = index.lineage(artifact_id)?;

    print_artifact_header();
    print_artifact(&root);
    for artifact in &lineage {
        print_artifact(artifact);
    }

    Ok(())
}

fn print_artifact_header() {
    println!(
        "{:<38} {:<14} {:<20} {:<24} CREATED",
        "ARTIFACT ID", "TYPE", "PRODUCER", "RUN"
    );
    println!("{}", "-".repeat(120));
}

fn print_artifact(artifact: &ArtifactRef) {
    println!(
        "{:<38} {:<14} {:<20} {:<24} {}",
        artifact.artifact_id,
        artifact.artifact_type,
        artifact.producer_id,
        artifact.run_id,
        artifact.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

/// Print the event log of a run
async fn show_events(run_root: &Path) -> Result<()> {
    let log = RunLog::for_run(run_root);
    let events = log.replay().await?;

    if events.is_empty() {
        println!("No events found at {}", log.events_path().display());
        return Ok(());
    }

    for event in events {
        let step = event.step_id.as_deref().unwrap_or("-");
        let attempt = event
            .attempt
            .map(|a| format!("#{}", a))
            .unwrap_or_default();
        print!(
            "{} {:<16} {:<16} {:<4} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            serde_json::to_value(event.event_type)?
                .as_str()
                .unwrap_or_default(),
            step,
            attempt,
            event.summary
        );
        if let Some(error) = event.error {
            print!(" ({})", error);
        }
        println!();
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("stepkernel configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:           {}", cfg.home.display());
    println!("  Artifact index: {}", cfg.index.display());
    println!("  Runs:           {}", cfg.runs.display());
    println!();
    println!("Limits:");
    println!(
        "  Default step timeout: {}s",
        cfg.limits.default_step_timeout_seconds
    );
    println!("  Max step executions:  {}", cfg.limits.max_step_executions);
    println!("  Run timeout:          {}s", cfg.limits.run_timeout_seconds);

    Ok(())
}
