//! Workspace-wide SQLite index of artifacts.
//!
//! The index outlives any single run. Every operation opens a short-lived
//! connection, runs inside one transaction, commits, and closes, so
//! concurrent runs can insert safely without sharing a connection.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use super::artifact_store::StoreError;
use crate::domain::ArtifactRef;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS artifacts (
  artifact_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  artifact_type TEXT NOT NULL,
  storage_kind TEXT NOT NULL,
  artifact_name TEXT NOT NULL,
  rel_path TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  created_at TEXT NOT NULL,
  producer_id TEXT NOT NULL,
  producer_kind TEXT NOT NULL,
  inputs_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(artifact_type);
CREATE INDEX IF NOT EXISTS idx_artifacts_producer ON artifacts(producer_id);
";

const SELECT_COLUMNS: &str = "artifact_id, run_id, artifact_type, storage_kind, artifact_name,
     rel_path, sha256, created_at, producer_id, producer_kind, inputs_json";

/// Filters for `ArtifactIndex::list`; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct ArtifactQuery {
    pub run_id: Option<String>,
    pub artifact_type: Option<String>,
    pub producer_id: Option<String>,
}

impl ArtifactQuery {
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    pub fn with_producer(mut self, producer_id: impl Into<String>) -> Self {
        self.producer_id = Some(producer_id.into());
        self
    }
}

/// Handle to the index database file
#[derive(Debug, Clone)]
pub struct ArtifactIndex {
    path: PathBuf,
}

impl ArtifactIndex {
    /// Open (creating if needed) the index at `path` and ensure its schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let index = Self { path: path.into() };

        if let Some(parent) = index.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        index.transact(|tx| tx.execute_batch(SCHEMA))?;
        Ok(index)
    }

    /// Open the index at the configured workspace location
    pub fn open_default() -> anyhow::Result<Self> {
        let path = crate::config::paths::index_path()?;
        Ok(Self::open(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(conn)
    }

    /// Open a connection, run `f` in one transaction, commit, and close
    fn transact<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        drop(conn);
        Ok(out)
    }

    /// Insert one artifact row
    pub fn insert(&self, artifact: &ArtifactRef) -> Result<(), StoreError> {
        let inputs_json = serde_json::to_string(&artifact.input_artifact_refs)?;

        self.transact(|tx| {
            tx.execute(
                "INSERT INTO artifacts(
                    artifact_id, run_id, artifact_type, storage_kind, artifact_name,
                    rel_path, sha256, created_at, producer_id, producer_kind, inputs_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    artifact.artifact_id,
                    artifact.run_id,
                    artifact.artifact_type,
                    artifact.storage_kind.as_str(),
                    artifact.artifact_name,
                    artifact.rel_path,
                    artifact.sha256,
                    artifact.created_at.to_rfc3339(),
                    artifact.producer_id,
                    artifact.producer_kind.as_str(),
                    inputs_json,
                ],
            )
        })?;

        debug!(artifact_id = %artifact.artifact_id, run_id = %artifact.run_id, "Indexed artifact");
        Ok(())
    }

    /// Look up one artifact by id
    pub fn get(&self, artifact_id: &str) -> Result<Option<ArtifactRef>, StoreError> {
        let row = self.transact(|tx| {
            tx.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM artifacts WHERE artifact_id = ?1"),
                params![artifact_id],
                IndexRow::from_row,
            )
            .optional()
        })?;

        row.map(IndexRow::into_ref).transpose()
    }

    /// List artifacts matching `query`, oldest first
    pub fn list(&self, query: &ArtifactQuery) -> Result<Vec<ArtifactRef>, StoreError> {
        let rows = self.transact(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM artifacts
                 WHERE (?1 IS NULL OR run_id = ?1)
                   AND (?2 IS NULL OR artifact_type = ?2)
                   AND (?3 IS NULL OR producer_id = ?3)
                 ORDER BY created_at ASC, artifact_id ASC"
            ))?;
            let rows = stmt
                .query_map(
                    params![query.run_id, query.artifact_type, query.producer_id],
                    IndexRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(IndexRow::into_ref).collect()
    }

    /// Transitive inputs of an artifact, breadth first, each listed once.
    ///
    /// Inputs that are not in the index are skipped.
    pub fn lineage(&self, artifact_id: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        let root = self
            .get(artifact_id)?
            .ok_or_else(|| StoreError::NotFound(artifact_id.to_string()))?;

        let mut seen: HashSet<String> = HashSet::from([root.artifact_id.clone()]);
        let mut queue: VecDeque<String> = root.input_artifact_refs.into_iter().collect();
        let mut out = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(found) = self.get(&id)? {
                queue.extend(found.input_artifact_refs.iter().cloned());
                out.push(found);
            }
        }

        Ok(out)
    }
}

/// Raw column values of one index row
struct IndexRow {
    artifact_id: String,
    run_id: String,
    artifact_type: String,
    storage_kind: String,
    artifact_name: String,
    rel_path: String,
    sha256: String,
    created_at: String,
    producer_id: String,
    producer_kind: String,
    inputs_json: String,
}

impl IndexRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            artifact_id: row.get(0)?,
            run_id: row.get(1)?,
            artifact_type: row.get(2)?,
            storage_kind: row.get(3)?,
            artifact_name: row.get(4)?,
            rel_path: row.get(5)?,
            sha256: row.get(6)?,
            created_at: row.get(7)?,
            producer_id: row.get(8)?,
            producer_kind: row.get(9)?,
            inputs_json: row.get(10)?,
        })
    }

    fn into_ref(self) -> Result<ArtifactRef, StoreError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::CorruptIndex(format!("created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(ArtifactRef {
            artifact_id: self.artifact_id,
            run_id: self.run_id,
            artifact_type: self.artifact_type,
            storage_kind: self.storage_kind.parse().map_err(StoreError::CorruptIndex)?,
            artifact_name: self.artifact_name,
            rel_path: self.rel_path,
            sha256: self.sha256,
            created_at,
            producer_id: self.producer_id,
            producer_kind: self.producer_kind.parse().map_err(StoreError::CorruptIndex)?,
            input_artifact_refs: serde_json::from_str(&self.inputs_json)?,
        })
    }
}
