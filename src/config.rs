//! Configuration for stepkernel paths and run limits.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEPKERNEL_HOME, STEPKERNEL_INDEX)
//! 2. Config file (.stepkernel/config.yaml)
//! 3. Defaults (~/.stepkernel)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stepkernel/config.yaml
//! - Paths in the config file are relative to the .stepkernel/ directory

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "STEPKERNEL_HOME";

/// Environment variable overriding the artifact index location
pub const INDEX_ENV: &str = "STEPKERNEL_INDEX";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: Option<LimitsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Kernel state directory
    pub home: Option<String>,
    /// Workspace-wide SQLite artifact index
    pub index: Option<String>,
    /// Default parent directory for run roots
    pub runs: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub default_step_timeout_seconds: Option<u64>,
    pub max_step_executions: Option<u32>,
    pub run_timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub index: PathBuf,
    pub runs: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitSettings {
    pub default_step_timeout_seconds: u64,
    /// Cap on executor invocations per run
    pub max_step_executions: u32,
    pub run_timeout_seconds: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            default_step_timeout_seconds: 300,
            max_step_executions: 200,
            run_timeout_seconds: 3600,
        }
    }
}

impl LimitSettings {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    fn from_file(limits: Option<&LimitsConfig>) -> Self {
        let defaults = Self::default();
        let Some(limits) = limits else {
            return defaults;
        };

        Self {
            default_step_timeout_seconds: limits
                .default_step_timeout_seconds
                .unwrap_or(defaults.default_step_timeout_seconds),
            max_step_executions: limits
                .max_step_executions
                .unwrap_or(defaults.max_step_executions),
            run_timeout_seconds: limits
                .run_timeout_seconds
                .unwrap_or(defaults.run_timeout_seconds),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".stepkernel").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stepkernel");

    let config_file = find_config_file();
    let file = config_file
        .as_deref()
        .map(|path| load_config_file(path).map(|c| (path, c)))
        .transpose()?;

    // Relative paths in the file resolve against .stepkernel/
    let (paths, limits, config_dir) = match file {
        Some((path, config)) => (
            config.paths,
            LimitSettings::from_file(config.limits.as_ref()),
            path.parent().map(Path::to_path_buf),
        ),
        None => (PathsConfig::default(), LimitSettings::default(), None),
    };
    let from_file = |value: &Option<String>| match (value, &config_dir) {
        (Some(v), Some(dir)) => Some(resolve_path(dir, v)),
        _ => None,
    };

    let home = std::env::var(HOME_ENV)
        .map(PathBuf::from)
        .ok()
        .or_else(|| from_file(&paths.home))
        .unwrap_or(default_home);

    let index = std::env::var(INDEX_ENV)
        .map(PathBuf::from)
        .ok()
        .or_else(|| from_file(&paths.index))
        .unwrap_or_else(|| home.join("artifact_index.sqlite3"));

    let runs = from_file(&paths.runs).unwrap_or_else(|| home.join("runs"));

    Ok(ResolvedConfig {
        home,
        index,
        runs,
        config_file,
        limits,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
