//! Safety policies contributed by packs and their no-weakening merge.
//!
//! A merged policy is never more permissive than any contributor:
//! - allowed tools and write paths are intersected
//! - denied write paths are unioned
//! - the smallest diff size limit wins
//! - network access is denied if any contributor denies it

use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether commands may use the network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAccess {
    Allow,
    #[default]
    Deny,
}

/// Constraints on what a run's commands may touch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Glob patterns of writable paths
    #[serde(default)]
    pub allow_write_paths: Vec<String>,

    /// Glob patterns that are never writable (wins over allow)
    #[serde(default)]
    pub deny_write_paths: Vec<String>,

    #[serde(default)]
    pub max_diff_size_bytes: Option<u64>,

    #[serde(default)]
    pub allowed_tools: Vec<String>,

    #[serde(default)]
    pub network_access: NetworkAccess,
}

impl SafetyPolicy {
    /// Check a write to `path` (and its diff size, if known)
    pub fn check_write(&self, path: &Path, diff_size: Option<u64>) -> Result<(), SafetyViolation> {
        let path_str = path.to_string_lossy();

        if let Some(pattern) = first_match(&self.deny_write_paths, &path_str) {
            return Err(SafetyViolation::WriteDenied {
                path: path_str.to_string(),
                pattern,
            });
        }

        if first_match(&self.allow_write_paths, &path_str).is_none() {
            return Err(SafetyViolation::WriteNotAllowed {
                path: path_str.to_string(),
            });
        }

        if let Some(size) = diff_size {
            self.check_diff_size(size)?;
        }

        Ok(())
    }

    /// Check a diff size against the limit
    pub fn check_diff_size(&self, size: u64) -> Result<(), SafetyViolation> {
        match self.max_diff_size_bytes {
            Some(limit) if size > limit => Err(SafetyViolation::DiffTooLarge {
                actual: size,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Check that a tool is on the allow list
    pub fn check_tool(&self, tool: &str) -> Result<(), SafetyViolation> {
        if self.allowed_tools.iter().any(|t| t == tool) {
            Ok(())
        } else {
            Err(SafetyViolation::ToolNotAllowed {
                tool: tool.to_string(),
            })
        }
    }

    pub fn check_network(&self) -> Result<(), SafetyViolation> {
        match self.network_access {
            NetworkAccess::Allow => Ok(()),
            NetworkAccess::Deny => Err(SafetyViolation::NetworkDenied),
        }
    }
}

/// Return the first pattern in `patterns` that matches `path`
fn first_match(patterns: &[String], path: &str) -> Option<String> {
    patterns
        .iter()
        .find(|p| Pattern::new(p).map(|pat| pat.matches(path)).unwrap_or(false))
        .cloned()
}

/// Merge contributed policies without weakening any of them.
///
/// Returns `None` when nothing was contributed.
pub fn merge_pack_safety_policies<'a>(
    policies: impl IntoIterator<Item = &'a SafetyPolicy>,
) -> Option<SafetyPolicy> {
    let mut policies = policies.into_iter();
    let mut merged = policies.next()?.clone();
    dedup_in_place(&mut merged.deny_write_paths);

    for policy in policies {
        merged
            .allow_write_paths
            .retain(|p| policy.allow_write_paths.contains(p));
        merged.allowed_tools.retain(|t| policy.allowed_tools.contains(t));

        for pattern in &policy.deny_write_paths {
            if !merged.deny_write_paths.contains(pattern) {
                merged.deny_write_paths.push(pattern.clone());
            }
        }

        merged.max_diff_size_bytes = match (merged.max_diff_size_bytes, policy.max_diff_size_bytes)
        {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if policy.network_access == NetworkAccess::Deny {
            merged.network_access = NetworkAccess::Deny;
        }
    }

    Some(merged)
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
}

/// Safety policy violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Write to {path} denied by pattern {pattern}")]
    WriteDenied { path: String, pattern: String },

    #[error("Write to {path} is not covered by any allowed path")]
    WriteNotAllowed { path: String },

    #[error("Diff size exceeded: {actual} > {limit}")]
    DiffTooLarge { actual: u64, limit: u64 },

    #[error("Tool not allowed: {tool}")]
    ToolNotAllowed { tool: String },

    #[error("Network access denied")]
    NetworkDenied,
}
