//! `PipelineStore` (content-addressed image registry) and
//! `PipelineVersionStore` (per-name version history), plus a filesystem
//! wrapper providing durable persistence.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::content_hash::ContentHash;
use crate::error::ConstellationError;
use crate::module::ModuleRegistry;
use crate::pipeline::{PersistedPipelineImage, PipelineImage};

/// Thread-safe content-addressed store of `PipelineImage`s, with a
/// name→hash alias index and a syntactic-hash fast-path index.
pub struct PipelineStore {
    images: DashMap<String, Arc<PipelineImage>>,
    aliases: DashMap<String, String>,
    syntactic_index: DashMap<String, String>,
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStore {
    pub fn new() -> Self {
        Self {
            images: DashMap::new(),
            aliases: DashMap::new(),
            syntactic_index: DashMap::new(),
        }
    }

    /// Store an image, returning its structural hash.
    pub fn store(&self, image: PipelineImage) -> ContentHash {
        let hash = image.structural_hash.clone();
        self.images.insert(hash.to_hex(), Arc::new(image));
        hash
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Arc<PipelineImage>> {
        self.images.get(&hash.to_hex()).map(|v| v.clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<PipelineImage>> {
        let hash_hex = self.aliases.get(name)?;
        self.images.get(hash_hex.as_str()).map(|v| v.clone())
    }

    /// Remove an image, returning whether it was present.
    pub fn remove(&self, hash: &ContentHash) -> bool {
        self.images.remove(&hash.to_hex()).is_some()
    }

    /// Bind a name to a hash; subsequent `alias` calls for the same name
    /// replace the binding.
    pub fn alias(&self, name: impl Into<String>, hash: &ContentHash) {
        self.aliases.insert(name.into(), hash.to_hex());
    }

    pub fn resolve(&self, name: &str) -> Option<ContentHash> {
        let hex = self.aliases.get(name)?;
        ContentHash::from_hex(&hex).ok()
    }

    /// Index a `(syntacticHash, registryHash)` pair against a structural
    /// hash, for the compile fast path.
    pub fn index_syntactic(&self, syntactic: &ContentHash, registry_hash: &ContentHash, structural: &ContentHash) {
        self.syntactic_index
            .insert(format!("{}:{}", syntactic.to_hex(), registry_hash.to_hex()), structural.to_hex());
    }

    pub fn lookup_syntactic(&self, syntactic: &ContentHash, registry_hash: &ContentHash) -> Option<ContentHash> {
        let key = format!("{}:{}", syntactic.to_hex(), registry_hash.to_hex());
        let hex = self.syntactic_index.get(&key)?;
        ContentHash::from_hex(&hex).ok()
    }

    pub fn list_images(&self) -> Vec<ContentHash> {
        self.images.iter().filter_map(|e| ContentHash::from_hex(e.key()).ok()).collect()
    }

    pub fn list_aliases(&self) -> Vec<(String, ContentHash)> {
        self.aliases
            .iter()
            .filter_map(|e| ContentHash::from_hex(e.value()).ok().map(|h| (e.key().clone(), h)))
            .collect()
    }
}

/// Durable wrapper over an in-memory `PipelineStore`: reads hit the wrapped
/// store; writes go to both and are atomic (temp file + rename).
///
/// Layout: `images/<hash>.json`, `aliases.json`, `syntactic-index.json`.
pub struct FileSystemPipelineStore {
    inner: PipelineStore,
    root: PathBuf,
}

impl FileSystemPipelineStore {
    /// Load an existing on-disk store, or create an empty one at `root`.
    pub async fn open(root: impl AsRef<Path>, registry: &ModuleRegistry) -> Result<Self, ConstellationError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("images")).await?;

        let inner = PipelineStore::new();

        let images_dir = root.join("images");
        let mut read_dir = tokio::fs::read_dir(&images_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Ignore temp files: they don't match `<hash>.json` exactly
            // (the writer names them `.<hash>.json.<uuid>.tmp`).
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if stem.starts_with('.') {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            let persisted: PersistedPipelineImage = serde_json::from_slice(&data)?;
            if let Ok(image) = PipelineImage::from_persisted(persisted, registry) {
                inner.store(image);
            }
        }

        let aliases_path = root.join("aliases.json");
        if let Ok(data) = tokio::fs::read(&aliases_path).await {
            let aliases: BTreeMap<String, String> = serde_json::from_slice(&data).unwrap_or_default();
            for (name, hash_hex) in aliases {
                if let Ok(hash) = ContentHash::from_hex(&hash_hex) {
                    inner.alias(name, &hash);
                }
            }
        }

        let syntactic_path = root.join("syntactic-index.json");
        if let Ok(data) = tokio::fs::read(&syntactic_path).await {
            let index: BTreeMap<String, String> = serde_json::from_slice(&data).unwrap_or_default();
            for (key, structural_hex) in index {
                inner.syntactic_index.insert(key, structural_hex);
            }
        }

        Ok(Self { inner, root })
    }

    pub async fn store(&self, image: PipelineImage) -> Result<ContentHash, ConstellationError> {
        let persisted = image.to_persisted();
        let hash = self.inner.store(image);
        let path = self.root.join("images").join(format!("{}.json", hash.to_hex()));
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        atomic_write(&path, &bytes).await?;
        Ok(hash)
    }

    pub async fn alias(&self, name: impl Into<String>, hash: &ContentHash) -> Result<(), ConstellationError> {
        let name = name.into();
        self.inner.alias(name, hash);
        self.persist_aliases().await
    }

    async fn persist_aliases(&self) -> Result<(), ConstellationError> {
        let aliases: BTreeMap<String, String> = self
            .inner
            .aliases
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&aliases)?;
        atomic_write(&self.root.join("aliases.json"), &bytes).await
    }

    pub async fn index_syntactic(
        &self,
        syntactic: &ContentHash,
        registry_hash: &ContentHash,
        structural: &ContentHash,
    ) -> Result<(), ConstellationError> {
        self.inner.index_syntactic(syntactic, registry_hash, structural);
        let index: BTreeMap<String, String> = self
            .inner
            .syntactic_index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&index)?;
        atomic_write(&self.root.join("syntactic-index.json"), &bytes).await
    }

    pub async fn remove(&self, hash: &ContentHash) -> Result<bool, ConstellationError> {
        let removed = self.inner.remove(hash);
        if removed {
            let path = self.root.join("images").join(format!("{}.json", hash.to_hex()));
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(removed)
    }

    pub fn inner(&self) -> &PipelineStore {
        &self.inner
    }
}

/// Atomic file write: write to a uniquely-named temp file, fsync, rename.
pub(crate) async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConstellationError> {
    use tokio::io::AsyncWriteExt;
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// `{ version, structuralHash, createdAt, source? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub version: u64,
    pub structural_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub source: Option<String>,
}

#[derive(Default)]
struct VersionHistory {
    versions: Vec<PipelineVersion>,
    active: Option<u64>,
}

/// Per-pipeline-name ordered version history with an active-version
/// pointer.
pub struct PipelineVersionStore {
    histories: RwLock<BTreeMap<String, VersionHistory>>,
    max_versions_per_pipeline: Option<usize>,
}

impl PipelineVersionStore {
    pub fn new(max_versions_per_pipeline: Option<usize>) -> Self {
        Self { histories: RwLock::new(BTreeMap::new()), max_versions_per_pipeline }
    }

    /// Auto-increment `version` (starting at 1), append to history, set as
    /// active. Evicts the oldest version if `maxVersionsPerPipeline` is
    /// exceeded.
    pub fn record_version(&self, name: &str, hash: &ContentHash, source: Option<String>) -> PipelineVersion {
        let mut histories = self.histories.write();
        let history = histories.entry(name.to_string()).or_default();
        let next_version = history.versions.last().map(|v| v.version + 1).unwrap_or(1);
        let record = PipelineVersion {
            version: next_version,
            structural_hash: hash.to_string(),
            created_at: chrono::Utc::now(),
            source,
        };
        history.versions.push(record.clone());
        history.active = Some(next_version);
        if let Some(max) = self.max_versions_per_pipeline {
            while history.versions.len() > max {
                history.versions.remove(0);
            }
        }
        record
    }

    pub fn set_active_version(&self, name: &str, version: u64) -> Result<(), ConstellationError> {
        let mut histories = self.histories.write();
        let history = histories
            .get_mut(name)
            .ok_or_else(|| ConstellationError::PipelineNotFound(name.to_string()))?;
        if !history.versions.iter().any(|v| v.version == version) {
            return Err(ConstellationError::PipelineNotFound(format!("{name}@{version}")));
        }
        history.active = Some(version);
        Ok(())
    }

    pub fn active_version(&self, name: &str) -> Option<PipelineVersion> {
        let histories = self.histories.read();
        let history = histories.get(name)?;
        let active = history.active?;
        history.versions.iter().find(|v| v.version == active).cloned()
    }

    /// Resolve a recorded version number back to its structural hash, for
    /// bridging `CanaryRouter`'s version-number addressing to
    /// `PipelineStore`'s hash addressing.
    pub fn hash_for_version(&self, name: &str, version: u64) -> Option<ContentHash> {
        let histories = self.histories.read();
        let history = histories.get(name)?;
        history
            .versions
            .iter()
            .find(|v| v.version == version)
            .and_then(|v| ContentHash::from_hex(&v.structural_hash).ok())
    }

    /// The version immediately below the active one, for fast rollback.
    pub fn previous_version(&self, name: &str) -> Option<PipelineVersion> {
        let histories = self.histories.read();
        let history = histories.get(name)?;
        let active = history.active?;
        history.versions.iter().filter(|v| v.version < active).max_by_key(|v| v.version).cloned()
    }

    /// Newest first.
    pub fn list_versions(&self, name: &str) -> Vec<PipelineVersion> {
        let histories = self.histories.read();
        match histories.get(name) {
            Some(history) => {
                let mut versions = history.versions.clone();
                versions.sort_by(|a, b| b.version.cmp(&a.version));
                versions
            }
            None => Vec::new(),
        }
    }
}
