//! Durable suspended-execution state: the `SuspendedExecution` record, its
//! on-disk codec, and pluggable stores (in-memory, filesystem-backed).
//!
//! The wire format is grounded directly in the teacher's checkpoint
//! integrity header (`dashflow::checkpoint`): magic bytes + format version +
//! CRC32 + length, wrapping a serialized payload. JSON is used for the
//! payload rather than bincode so a suspension on disk stays
//! human-inspectable, matching `FileSystemPipelineStore`'s plain-JSON
//! layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::content_hash::ContentHash;
use crate::dag::NodeId;
use crate::error::ConstellationError;
use crate::value::{CType, CValue};

const CODEC_MAGIC: &[u8; 4] = b"CSUS";
const CODEC_VERSION: u32 = 1;

/// A persisted partial execution, parked until the caller supplies the
/// inputs/node values it's missing.
///
/// Invariant: `missing_inputs` and `provided_inputs` are disjoint; every
/// `pending_outputs` entry transitively depends on at least one entry of
/// `missing_inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedExecution {
    pub structural_hash: String,
    pub provided_inputs: BTreeMap<String, CValue>,
    pub computed_nodes: BTreeMap<NodeId, CValue>,
    pub missing_inputs: BTreeMap<String, CType>,
    pub pending_outputs: Vec<String>,
    pub resumption_count: u32,
    pub created_at_millis: i64,
}

/// Summary row returned by `list`, per spec.md §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionSummary {
    pub handle: String,
    pub structural_hash: String,
    pub resumption_count: u32,
    pub missing_inputs: Vec<String>,
    pub created_at_millis: i64,
}

/// Conjunction of optional predicates over `SuspensionSummary` fields.
#[derive(Debug, Clone, Default)]
pub struct SuspensionFilter {
    pub handle: Option<String>,
    pub structural_hash: Option<String>,
    pub resumption_count: Option<u32>,
    pub missing_input: Option<String>,
}

impl SuspensionFilter {
    fn matches(&self, summary: &SuspensionSummary) -> bool {
        if let Some(handle) = &self.handle {
            if handle != &summary.handle {
                return false;
            }
        }
        if let Some(hash) = &self.structural_hash {
            if hash != &summary.structural_hash {
                return false;
            }
        }
        if let Some(count) = self.resumption_count {
            if count != summary.resumption_count {
                return false;
            }
        }
        if let Some(name) = &self.missing_input {
            if !summary.missing_inputs.iter().any(|m| m == name) {
                return false;
            }
        }
        true
    }
}

fn summarize(handle: &str, suspension: &SuspendedExecution) -> SuspensionSummary {
    SuspensionSummary {
        handle: handle.to_string(),
        structural_hash: suspension.structural_hash.clone(),
        resumption_count: suspension.resumption_count,
        missing_inputs: suspension.missing_inputs.keys().cloned().collect(),
        created_at_millis: suspension.created_at_millis,
    }
}

/// `b"CSUS"` + u32 version + u32 CRC32(payload) + u64 length + JSON payload.
pub struct SuspensionCodec;

impl SuspensionCodec {
    pub fn encode(suspension: &SuspendedExecution) -> Result<Vec<u8>, ConstellationError> {
        let payload = serde_json::to_vec(suspension)?;
        let crc = crc32fast::hash(&payload);
        let mut out = Vec::with_capacity(4 + 4 + 4 + 8 + payload.len());
        out.extend_from_slice(CODEC_MAGIC);
        out.extend_from_slice(&CODEC_VERSION.to_be_bytes());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&payload);

        // Round-trip validation, matching spec.md §4.2's "optionally
        // validates a round-trip"; only runs in debug builds since it
        // re-decodes and re-parses every save.
        debug_assert!(
            Self::decode(&out).ok().as_ref() == Some(suspension),
            "suspension codec round-trip failed"
        );
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<SuspendedExecution, ConstellationError> {
        if bytes.len() < 20 || &bytes[0..4] != CODEC_MAGIC {
            return Err(ConstellationError::Internal("corrupt suspension: bad magic".to_string()));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap_or_default());
        if version != CODEC_VERSION {
            return Err(ConstellationError::Internal(format!("unsupported suspension codec version {version}")));
        }
        let stored_crc = u32::from_be_bytes(bytes[8..12].try_into().unwrap_or_default());
        let length = u64::from_be_bytes(bytes[12..20].try_into().unwrap_or_default()) as usize;
        let payload = bytes.get(20..20 + length).ok_or_else(|| {
            ConstellationError::Internal("corrupt suspension: truncated payload".to_string())
        })?;
        if crc32fast::hash(payload) != stored_crc {
            return Err(ConstellationError::Internal("corrupt suspension: CRC mismatch".to_string()));
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Storage for suspended executions. No TTL: a suspended execution has no
/// active deadline (see DESIGN.md Open Question decision), so eviction is
/// only ever explicit (`delete`) or resume-driven.
#[async_trait]
pub trait SuspensionStore: Send + Sync {
    async fn save(&self, handle: &str, suspension: SuspendedExecution) -> Result<(), ConstellationError>;
    async fn load(&self, handle: &str) -> Option<SuspendedExecution>;
    async fn delete(&self, handle: &str) -> bool;
    async fn list(&self, filter: &SuspensionFilter) -> Vec<SuspensionSummary>;
}

/// In-memory suspension store.
#[derive(Default)]
pub struct InMemorySuspensionStore {
    entries: DashMap<String, SuspendedExecution>,
}

impl InMemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuspensionStore for InMemorySuspensionStore {
    async fn save(&self, handle: &str, suspension: SuspendedExecution) -> Result<(), ConstellationError> {
        self.entries.insert(handle.to_string(), suspension);
        Ok(())
    }

    async fn load(&self, handle: &str) -> Option<SuspendedExecution> {
        self.entries.get(handle).map(|e| e.clone())
    }

    async fn delete(&self, handle: &str) -> bool {
        self.entries.remove(handle).is_some()
    }

    async fn list(&self, filter: &SuspensionFilter) -> Vec<SuspensionSummary> {
        self.entries
            .iter()
            .map(|e| summarize(e.key(), e.value()))
            .filter(|s| filter.matches(s))
            .collect()
    }
}

/// Durable filesystem-backed suspension store: `suspensions/<handle>.json`
/// (actually the `SuspensionCodec` wire format, not plain JSON, despite the
/// extension — matching `FileSystemPipelineStore`'s layout convention in
/// spec.md §6.3).
pub struct FileSystemSuspensionStore {
    inner: InMemorySuspensionStore,
    root: PathBuf,
}

impl FileSystemSuspensionStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ConstellationError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let inner = InMemorySuspensionStore::new();
        let mut read_dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if stem.starts_with('.') {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match SuspensionCodec::decode(&bytes) {
                Ok(suspension) => {
                    inner.entries.insert(stem.to_string(), suspension);
                }
                Err(err) => {
                    tracing::warn!(handle = stem, %err, "dropping unreadable suspension file");
                }
            }
        }

        Ok(Self { inner, root })
    }

    fn path_for(&self, handle: &str) -> PathBuf {
        self.root.join(format!("{handle}.json"))
    }
}

#[async_trait]
impl SuspensionStore for FileSystemSuspensionStore {
    async fn save(&self, handle: &str, suspension: SuspendedExecution) -> Result<(), ConstellationError> {
        let bytes = SuspensionCodec::encode(&suspension)?;
        crate::store::atomic_write(&self.path_for(handle), &bytes).await?;
        self.inner.save(handle, suspension).await
    }

    async fn load(&self, handle: &str) -> Option<SuspendedExecution> {
        self.inner.load(handle).await
    }

    async fn delete(&self, handle: &str) -> bool {
        let removed = self.inner.delete(handle).await;
        if removed {
            let _ = tokio::fs::remove_file(self.path_for(handle)).await;
        }
        removed
    }

    async fn list(&self, filter: &SuspensionFilter) -> Vec<SuspensionSummary> {
        self.inner.list(filter).await
    }
}

/// A fresh opaque 128-bit suspension handle (UUIDv4).
pub fn new_handle() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(super) fn hash_to_string(hash: &ContentHash) -> String {
    hash.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuspendedExecution {
        SuspendedExecution {
            structural_hash: "sha256:abc".to_string(),
            provided_inputs: BTreeMap::from([("a".to_string(), CValue::Int64(1))]),
            computed_nodes: BTreeMap::new(),
            missing_inputs: BTreeMap::from([("b".to_string(), CType::Int64)]),
            pending_outputs: vec!["out".to_string()],
            resumption_count: 0,
            created_at_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn codec_roundtrips() {
        let suspension = sample();
        let bytes = SuspensionCodec::encode(&suspension).unwrap();
        let decoded = SuspensionCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, suspension);
    }

    #[test]
    fn codec_rejects_corrupt_crc() {
        let suspension = sample();
        let mut bytes = SuspensionCodec::encode(&suspension).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(SuspensionCodec::decode(&bytes).is_err());
    }

    #[tokio::test]
    async fn in_memory_store_save_load_delete() {
        let store = InMemorySuspensionStore::new();
        let handle = new_handle();
        store.save(&handle, sample()).await.unwrap();
        assert!(store.load(&handle).await.is_some());
        assert!(store.delete(&handle).await);
        assert!(store.load(&handle).await.is_none());
    }

    #[tokio::test]
    async fn filter_conjunction_narrows_results() {
        let store = InMemorySuspensionStore::new();
        store.save("h1", sample()).await.unwrap();
        let mut other = sample();
        other.structural_hash = "sha256:def".to_string();
        store.save("h2", other).await.unwrap();

        let filter = SuspensionFilter { structural_hash: Some("sha256:abc".to_string()), ..Default::default() };
        let results = store.list(&filter).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].handle, "h1");
    }

    #[tokio::test]
    async fn filesystem_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let handle = new_handle();
        {
            let store = FileSystemSuspensionStore::open(dir.path()).await.unwrap();
            store.save(&handle, sample()).await.unwrap();
        }
        let reopened = FileSystemSuspensionStore::open(dir.path()).await.unwrap();
        assert!(reopened.load(&handle).await.is_some());
    }
}
