//! Durable, content-addressed artifact storage for one run.
//!
//! Layout under the run root:
//!
//! ```text
//! <run_root>/logs/
//! <run_root>/artifacts/<artifact_id>/{payload.json|payload.txt|<file name>}
//! <run_root>/artifacts/<artifact_id>/meta.json
//! <run_root>/tmp/
//! ```
//!
//! Payload bytes are flushed and fsynced before the index row is written,
//! so an index row never points at missing or partial data.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::index::{ArtifactIndex, ArtifactQuery};
use super::registry::{RegistryError, SchemaRegistry};
use super::run_log::EVENTS_FILE;
use crate::config::paths::{ARTIFACTS_DIR, LOGS_DIR, TMP_DIR};
use crate::domain::artifact::sha256_hex;
use crate::domain::run::RUN_STATE_FILE;
use crate::domain::{ArtifactRef, ArtifactSpec, Envelope, StorageKind};

pub const META_FILE: &str = "meta.json";
pub const JSON_PAYLOAD: &str = "payload.json";
pub const TEXT_PAYLOAD: &str = "payload.txt";

/// Artifact storage and index errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact belongs to run {actual}, not {expected}")]
    RunMismatch { expected: String, actual: String },

    #[error("artifact path escapes the run root: {0}")]
    PathTraversal(String),

    #[error("artifact directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("run directory not initialised: {0}")]
    MissingRunRoot(PathBuf),

    #[error("run directory already holds a run: {0}")]
    RunRootInUse(PathBuf),

    #[error("expected schema {expected}, envelope carries {actual}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("envelope payload hash mismatch for artifact {0}")]
    HashMismatch(String),

    #[error("artifact {artifact_id} is {actual:?}, not {expected:?}")]
    WrongStorageKind {
        artifact_id: String,
        expected: StorageKind,
        actual: StorageKind,
    },

    #[error(transparent)]
    Schema(#[from] RegistryError),

    #[error("corrupt index row: {0}")]
    CorruptIndex(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),
}

/// A retrieved payload
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload {
    Json(Value),
    Text(String),
    File(Vec<u8>),
}

/// Artifact store bound to a single run
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_id: String,
    run_root: PathBuf,
    artifacts_dir: PathBuf,
    index: ArtifactIndex,
    schemas: Option<Arc<SchemaRegistry>>,
}

impl ArtifactStore {
    /// Create the run layout (`logs/`, `artifacts/`, `tmp/`) and bind a store to it.
    ///
    /// A run root that already has a run state or event log is rejected.
    pub async fn create(
        run_root: &Path,
        run_id: impl Into<String>,
        index: ArtifactIndex,
    ) -> Result<Self, StoreError> {
        let previous = [
            run_root.join(RUN_STATE_FILE),
            run_root.join(LOGS_DIR).join(EVENTS_FILE),
        ];
        if previous.iter().any(|path| path.exists()) {
            return Err(StoreError::RunRootInUse(run_root.to_path_buf()));
        }

        for dir in [LOGS_DIR, ARTIFACTS_DIR, TMP_DIR] {
            fs::create_dir_all(run_root.join(dir)).await?;
        }
        Self::open(run_root, run_id, index)
    }

    /// Bind a store to an existing run directory
    pub fn open(
        run_root: &Path,
        run_id: impl Into<String>,
        index: ArtifactIndex,
    ) -> Result<Self, StoreError> {
        let artifacts_dir = run_root.join(ARTIFACTS_DIR);
        if !artifacts_dir.is_dir() {
            return Err(StoreError::MissingRunRoot(run_root.to_path_buf()));
        }

        Ok(Self {
            run_id: run_id.into(),
            run_root: run_root.to_path_buf(),
            artifacts_dir,
            index,
            schemas: None,
        })
    }

    /// Validate envelopes against registered schema models in `get_validated`
    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_root.join(LOGS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.run_root.join(TMP_DIR)
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    /// Store a JSON payload as `payload.json`
    pub async fn put_json(
        &self,
        value: &Value,
        spec: ArtifactSpec,
    ) -> Result<ArtifactRef, StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_artifact(JSON_PAYLOAD, &bytes, StorageKind::Json, spec)
            .await
    }

    /// Store a text payload as `payload.txt`
    pub async fn put_text(&self, text: &str, spec: ArtifactSpec) -> Result<ArtifactRef, StoreError> {
        self.write_artifact(TEXT_PAYLOAD, text.as_bytes(), StorageKind::Text, spec)
            .await
    }

    /// Copy a file into the store, keeping its file name
    pub async fn put_file(
        &self,
        source: &Path,
        spec: ArtifactSpec,
    ) -> Result<ArtifactRef, StoreError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| is_plain_file_name(n) && n != META_FILE)
            .unwrap_or_else(|| "payload.bin".to_string());

        let bytes = fs::read(source).await?;
        self.write_artifact(&file_name, &bytes, StorageKind::File, spec)
            .await
    }

    /// Wrap `payload` in a schema-stamped envelope and store it as JSON
    pub async fn put_envelope(
        &self,
        schema_id: &str,
        payload: Value,
        spec: ArtifactSpec,
    ) -> Result<ArtifactRef, StoreError> {
        let envelope = Envelope::new(schema_id, payload, &spec);
        let value = serde_json::to_value(&envelope)?;
        self.put_json(&value, spec).await
    }

    async fn write_artifact(
        &self,
        file_name: &str,
        bytes: &[u8],
        storage_kind: StorageKind,
        spec: ArtifactSpec,
    ) -> Result<ArtifactRef, StoreError> {
        let artifact_id = Uuid::new_v4().to_string();
        let dir = self.artifacts_dir.join(&artifact_id);

        // create_dir (not create_dir_all): an existing directory is an error
        fs::create_dir(&dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(dir.clone())
            } else {
                StoreError::Io(e)
            }
        })?;

        write_durable(&dir.join(file_name), bytes).await?;

        let artifact = ArtifactRef {
            artifact_id: artifact_id.clone(),
            run_id: self.run_id.clone(),
            artifact_type: spec.artifact_type,
            storage_kind,
            artifact_name: spec.artifact_name.unwrap_or_else(|| file_name.to_string()),
            rel_path: format!("{}/{}/{}", ARTIFACTS_DIR, artifact_id, file_name),
            sha256: sha256_hex(bytes),
            created_at: Utc::now(),
            producer_id: spec.producer_id,
            producer_kind: spec.producer_kind,
            input_artifact_refs: spec.inputs,
        };

        let meta = serde_json::to_vec_pretty(&artifact)?;
        write_durable(&dir.join(META_FILE), &meta).await?;

        self.index.insert(&artifact)?;

        debug!(
            artifact_id = %artifact.artifact_id,
            artifact_type = %artifact.artifact_type,
            size = bytes.len(),
            "Stored artifact"
        );
        Ok(artifact)
    }

    /// Resolve the payload path of an artifact owned by this run
    pub fn open_path(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        if artifact.run_id != self.run_id {
            return Err(StoreError::RunMismatch {
                expected: self.run_id.clone(),
                actual: artifact.run_id.clone(),
            });
        }

        let rel = Path::new(&artifact.rel_path);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || !rel.starts_with(ARTIFACTS_DIR) {
            return Err(StoreError::PathTraversal(artifact.rel_path.clone()));
        }

        let path = self.run_root.join(rel);
        if path.exists() {
            let root = self.run_root.canonicalize()?;
            if !path.canonicalize()?.starts_with(&root) {
                return Err(StoreError::PathTraversal(artifact.rel_path.clone()));
            }
        }

        Ok(path)
    }

    /// Read an artifact payload owned by this run
    pub async fn get(&self, artifact: &ArtifactRef) -> Result<StoredPayload, StoreError> {
        let path = self.open_path(artifact)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(artifact.artifact_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(match artifact.storage_kind {
            StorageKind::Json => StoredPayload::Json(serde_json::from_slice(&bytes)?),
            StorageKind::Text => StoredPayload::Text(String::from_utf8_lossy(&bytes).into_owned()),
            StorageKind::File => StoredPayload::File(bytes),
        })
    }

    /// Read a JSON artifact
    pub async fn get_json(&self, artifact: &ArtifactRef) -> Result<Value, StoreError> {
        match self.get(artifact).await? {
            StoredPayload::Json(value) => Ok(value),
            _ => Err(StoreError::WrongStorageKind {
                artifact_id: artifact.artifact_id.clone(),
                expected: StorageKind::Json,
                actual: artifact.storage_kind,
            }),
        }
    }

    /// Read an envelope and check it before handing it out.
    ///
    /// Verifies the schema id, the canonical payload hash, and (when the
    /// store's registry knows the schema) the payload against its model.
    pub async fn get_validated(
        &self,
        artifact: &ArtifactRef,
        expected_schema_id: &str,
    ) -> Result<Envelope, StoreError> {
        let value = self.get_json(artifact).await?;
        let envelope: Envelope = serde_json::from_value(value)?;

        if envelope.meta.schema_id != expected_schema_id {
            return Err(StoreError::SchemaMismatch {
                expected: expected_schema_id.to_string(),
                actual: envelope.meta.schema_id,
            });
        }

        if !envelope.is_intact() {
            return Err(StoreError::HashMismatch(artifact.artifact_id.clone()));
        }

        if let Some(ref schemas) = self.schemas {
            if schemas.contains(expected_schema_id) {
                schemas.validate(expected_schema_id, &envelope.payload)?;
            }
        }

        Ok(envelope)
    }

    /// Recompute the digest of the stored bytes and compare it to the ref
    pub async fn verify(&self, artifact: &ArtifactRef) -> Result<bool, StoreError> {
        let path = self.open_path(artifact)?;
        let bytes = fs::read(&path).await?;
        Ok(sha256_hex(&bytes) == artifact.sha256)
    }

    /// Query the shared index
    pub fn list(&self, query: &ArtifactQuery) -> Result<Vec<ArtifactRef>, StoreError> {
        self.index.list(query)
    }
}

/// Write a new file, flush and fsync it
async fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProducerKind;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store(temp: &TempDir) -> ArtifactStore {
        let index = ArtifactIndex::open(temp.path().join("index.sqlite3")).unwrap();
        ArtifactStore::create(&temp.path().join("run"), "run-1", index)
            .await
            .unwrap()
    }

    fn spec() -> ArtifactSpec {
        ArtifactSpec::new("report", "compile", ProducerKind::Step)
    }

    #[tokio::test]
    async fn test_layout_created() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        assert!(store.run_root().join("logs").is_dir());
        assert!(store.run_root().join("artifacts").is_dir());
        assert!(store.run_root().join("tmp").is_dir());
    }

    #[tokio::test]
    async fn test_used_run_root_rejected() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;
        let index = store.index().clone();

        // An empty layout can still be claimed
        let reclaimed = ArtifactStore::create(store.run_root(), "run-2", index.clone()).await;
        assert!(reclaimed.is_ok());

        std::fs::write(store.logs_dir().join(EVENTS_FILE), "{}\n").unwrap();
        assert!(matches!(
            ArtifactStore::create(store.run_root(), "run-3", index.clone()).await,
            Err(StoreError::RunRootInUse(_))
        ));

        let other = temp.path().join("other");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join(RUN_STATE_FILE), "{}").unwrap();
        assert!(matches!(
            ArtifactStore::create(&other, "run-4", index).await,
            Err(StoreError::RunRootInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_put_json_writes_payload_meta_and_index() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let artifact = store.put_json(&json!({"ok": true}), spec()).await.unwrap();

        let dir = store.run_root().join("artifacts").join(&artifact.artifact_id);
        assert!(dir.join("payload.json").is_file());
        assert!(dir.join("meta.json").is_file());
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.artifact_name, "payload.json");

        let indexed = store.index().get(&artifact.artifact_id).unwrap().unwrap();
        assert_eq!(indexed, artifact);
        assert!(store.verify(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn test_identical_payloads_get_distinct_ids() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let a = store.put_json(&json!({"x": 1}), spec()).await.unwrap();
        let b = store.put_json(&json!({"x": 1}), spec()).await.unwrap();

        assert_ne!(a.artifact_id, b.artifact_id);
        assert_ne!(a.rel_path, b.rel_path);
        assert_eq!(a.sha256, b.sha256);
    }

    #[tokio::test]
    async fn test_put_text_and_file() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let text = store.put_text("hello", spec()).await.unwrap();
        assert_eq!(
            store.get(&text).await.unwrap(),
            StoredPayload::Text("hello".to_string())
        );

        let source = temp.path().join("report.xml");
        std::fs::write(&source, b"<ok/>").unwrap();
        let file = store.put_file(&source, spec()).await.unwrap();

        assert!(file.rel_path.ends_with("/report.xml"));
        assert_eq!(file.storage_kind, StorageKind::File);
        assert_eq!(
            store.get(&file).await.unwrap(),
            StoredPayload::File(b"<ok/>".to_vec())
        );
    }

    #[tokio::test]
    async fn test_foreign_run_rejected() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let mut artifact = store.put_text("x", spec()).await.unwrap();
        artifact.run_id = "run-2".to_string();

        assert!(matches!(
            store.open_path(&artifact),
            Err(StoreError::RunMismatch { .. })
        ));
        assert!(matches!(
            store.get(&artifact).await,
            Err(StoreError::RunMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let mut artifact = store.put_text("x", spec()).await.unwrap();
        for bad in ["../outside.txt", "artifacts/../../etc/passwd", "/etc/passwd", "logs/x"] {
            artifact.rel_path = bad.to_string();
            assert!(
                matches!(store.open_path(&artifact), Err(StoreError::PathTraversal(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_envelope_roundtrip_and_checks() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let artifact = store
            .put_envelope("ci.report", json!({"b": 2, "a": 1}), spec())
            .await
            .unwrap();

        let envelope = store.get_validated(&artifact, "ci.report").await.unwrap();
        assert_eq!(envelope.payload, json!({"a": 1, "b": 2}));

        assert!(matches!(
            store.get_validated(&artifact, "ci.other").await,
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_envelope_rejected() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp).await;

        let artifact = store
            .put_envelope("ci.report", json!({"passed": true}), spec())
            .await
            .unwrap();

        let path = store.open_path(&artifact).unwrap();
        let mut value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["payload"]["passed"] = json!(false);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            store.get_validated(&artifact, "ci.report").await,
            Err(StoreError::HashMismatch(_))
        ));
        assert!(!store.verify(&artifact).await.unwrap());
    }
}
