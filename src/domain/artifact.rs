//! Artifact references and schema-stamped envelopes.
//!
//! An `ArtifactRef` is written once per stored payload and never updated.
//! Lineage is expressed through `input_artifact_refs`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Reference to one stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Fresh per write, never reused
    pub artifact_id: String,

    /// Run that owns the artifact directory
    pub run_id: String,

    /// Free-form type tag (e.g. `step_attempt`, `gate_result`)
    pub artifact_type: String,

    pub storage_kind: StorageKind,

    pub artifact_name: String,

    /// Payload path relative to the run root
    pub rel_path: String,

    /// SHA-256 of the stored payload bytes (hex)
    pub sha256: String,

    pub created_at: DateTime<Utc>,

    pub producer_id: String,

    pub producer_kind: ProducerKind,

    /// Lineage pointers to the artifacts this one was derived from
    #[serde(default)]
    pub input_artifact_refs: Vec<String>,
}

/// How the payload is stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageKind {
    /// `payload.json`
    Json,
    /// `payload.txt`
    Text,
    /// Copied file under its original name
    File,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Json => "JSON",
            StorageKind::Text => "TEXT",
            StorageKind::File => "FILE",
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JSON" => Ok(StorageKind::Json),
            "TEXT" => Ok(StorageKind::Text),
            "FILE" => Ok(StorageKind::File),
            other => Err(format!("unknown storage kind: {}", other)),
        }
    }
}

/// What produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Step,
    Gate,
    Kernel,
    External,
}

impl ProducerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerKind::Step => "step",
            ProducerKind::Gate => "gate",
            ProducerKind::Kernel => "kernel",
            ProducerKind::External => "external",
        }
    }
}

impl std::str::FromStr for ProducerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(ProducerKind::Step),
            "gate" => Ok(ProducerKind::Gate),
            "kernel" => Ok(ProducerKind::Kernel),
            "external" => Ok(ProducerKind::External),
            other => Err(format!("unknown producer kind: {}", other)),
        }
    }
}

/// Caller-supplied metadata for a new artifact
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub artifact_type: String,
    /// Defaults to the payload file name
    pub artifact_name: Option<String>,
    pub producer_id: String,
    pub producer_kind: ProducerKind,
    pub inputs: Vec<String>,
}

impl ArtifactSpec {
    pub fn new(
        artifact_type: impl Into<String>,
        producer_id: impl Into<String>,
        producer_kind: ProducerKind,
    ) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            artifact_name: None,
            producer_id: producer_id.into(),
            producer_kind,
            inputs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.artifact_name = Some(name.into());
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }
}

/// Envelope header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub schema_id: String,
    pub producer_id: String,
    pub producer_kind: ProducerKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// SHA-256 of the canonical (sorted-key) JSON of `payload`
    pub payload_sha256: String,
}

/// A schema-stamped wrapper around a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: EnvelopeMeta,
    pub payload: Value,
}

impl Envelope {
    /// Wrap a payload, stamping its canonical hash
    pub fn new(schema_id: impl Into<String>, payload: Value, spec: &ArtifactSpec) -> Self {
        Self {
            meta: EnvelopeMeta {
                schema_id: schema_id.into(),
                producer_id: spec.producer_id.clone(),
                producer_kind: spec.producer_kind,
                created_at: Utc::now(),
                inputs: spec.inputs.clone(),
                payload_sha256: payload_sha256(&payload),
            },
            payload,
        }
    }

    /// True if the stamped hash still matches the payload
    pub fn is_intact(&self) -> bool {
        self.meta.payload_sha256 == payload_sha256(&self.payload)
    }
}

/// Rebuild a JSON value with object keys in sorted order
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact, sorted-key JSON text
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// SHA-256 (hex) of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 (hex) of the canonical JSON of a payload
pub fn payload_sha256(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}
