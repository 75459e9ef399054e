//! Canonical paths for stepkernel.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Run directory layout
//!
//! | Location | Contents |
//! |----------|----------|
//! | `<run_root>/logs/` | `events.jsonl` run event log |
//! | `<run_root>/artifacts/<id>/` | payload plus `meta.json` |
//! | `<run_root>/tmp/` | scratch space for commands |
//! | `<run_root>/run_state.json` | terminal run state |

use std::path::PathBuf;

use anyhow::Result;

/// Run log directory name
pub const LOGS_DIR: &str = "logs";

/// Artifact root directory name
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Scratch directory name
pub const TMP_DIR: &str = "tmp";

/// Get the stepkernel home directory (~/.stepkernel)
pub fn stepkernel_home() -> Result<PathBuf> {
    Ok(crate::config::config()?.home.clone())
}

/// Get the workspace-wide artifact index (~/.stepkernel/artifact_index.sqlite3)
pub fn index_path() -> Result<PathBuf> {
    Ok(crate::config::config()?.index.clone())
}

/// Get the default parent of run roots (~/.stepkernel/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.runs.clone())
}

/// Default run root for a run id
pub fn run_root(run_id: &str) -> Result<PathBuf> {
    Ok(runs_dir()?.join(run_id))
}
