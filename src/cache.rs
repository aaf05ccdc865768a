//! Pluggable cache SPI (`CacheBackend`), an in-memory TTL+LRU implementation,
//! a named-backend registry, and the compile cache built on top of it.
//!
//! Grounded in the teacher's `dashflow-registry::cache` module (TTL
//! expiration + LRU eviction over a `RwLock<HashMap<..>>`, a `CacheStats`
//! with `hit_rate()`), generalized from byte-blob values to typed
//! `CValue` results and extended with `getOrCompute` (at-most-one
//! concurrent compute per key) per spec.md §4.5.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::content_hash::ContentHash;
use crate::error::ConstellationError;
use crate::value::CValue;

/// Cache statistics for monitoring; `hit_rate` is hits / (hits + misses).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    value: CValue,
    created_at: Instant,
    ttl: Option<Duration>,
    last_accessed: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.created_at.elapsed() > ttl)
    }
}

/// Abstract cache backend per spec.md §4.5.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &ContentHash) -> Option<CValue>;
    async fn set(&self, key: ContentHash, value: CValue, ttl: Option<Duration>);
    async fn delete(&self, key: &ContentHash) -> bool;
    async fn contains(&self, key: &ContentHash) -> bool;
    async fn clear(&self);
    async fn stats(&self) -> CacheStats;

    /// Compute and cache `f()`'s result if `key` is absent, with at-most-one
    /// concurrent compute per key (later callers await the first's result
    /// rather than recomputing).
    async fn get_or_compute<F, Fut>(&self, key: ContentHash, ttl: Option<Duration>, f: F) -> Result<CValue, ConstellationError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<CValue, ConstellationError>> + Send;
}

/// In-memory cache with TTL expiration and LRU eviction once `max_entries`
/// is exceeded. A per-key `Mutex` gate (`inflight`) gives `get_or_compute`
/// at-most-one-concurrent-compute semantics without blocking unrelated keys.
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<ContentHash, Entry>>,
    inflight: Mutex<HashMap<ContentHash, Arc<Mutex<()>>>>,
    stats: RwLock<CacheStats>,
    max_entries: usize,
}

impl InMemoryCacheBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            max_entries,
        }
    }

    async fn evict_if_needed(&self) {
        let mut entries = self.entries.write().await;
        let mut stats = self.stats.write().await;

        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        stats.expirations += (before - entries.len()) as u64;

        if self.max_entries > 0 && entries.len() > self.max_entries {
            let to_evict = entries.len() - self.max_entries;
            let mut by_access: Vec<(ContentHash, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), v.last_accessed)).collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);
            for (key, _) in by_access.into_iter().take(to_evict) {
                entries.remove(&key);
                stats.evictions += 1;
            }
        }
        stats.entries = entries.len() as u64;
    }

    async fn inflight_gate(&self, key: &ContentHash) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &ContentHash) -> Option<CValue> {
        let mut entries = self.entries.write().await;
        let mut stats = self.stats.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                stats.misses += 1;
                stats.expirations += 1;
                None
            }
            Some(entry) => {
                entry.last_accessed = Instant::now();
                stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    async fn set(&self, key: ContentHash, value: CValue, ttl: Option<Duration>) {
        let now = Instant::now();
        {
            let mut entries = self.entries.write().await;
            entries.insert(key, Entry { value, created_at: now, ttl, last_accessed: now });
            self.stats.write().await.entries = entries.len() as u64;
        }
        self.evict_if_needed().await;
    }

    async fn delete(&self, key: &ContentHash) -> bool {
        let mut entries = self.entries.write().await;
        let existed = entries.remove(key).is_some();
        self.stats.write().await.entries = entries.len() as u64;
        existed
    }

    async fn contains(&self, key: &ContentHash) -> bool {
        // Lazy single-key cleanup (Open Question decision, see DESIGN.md):
        // an expired entry is dropped here rather than waiting for the next
        // `set`'s bulk sweep, so `contains` never reports a stale hit.
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
        *self.stats.write().await = CacheStats::default();
    }

    async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    async fn get_or_compute<F, Fut>(&self, key: ContentHash, ttl: Option<Duration>, f: F) -> Result<CValue, ConstellationError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<CValue, ConstellationError>> + Send,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let gate = self.inflight_gate(&key).await;
        let _permit = gate.lock().await;
        // Re-check: another caller may have populated it while we waited.
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let value = f().await?;
        self.set(key.clone(), value.clone(), ttl).await;
        self.inflight.lock().await.remove(&key);
        Ok(value)
    }
}

/// Named-backend registry, with a default backend for unqualified lookups.
pub struct CacheRegistry {
    backends: RwLock<HashMap<String, Arc<dyn CacheBackend>>>,
    default: Arc<dyn CacheBackend>,
}

impl CacheRegistry {
    pub fn new(default: Arc<dyn CacheBackend>) -> Self {
        Self { backends: RwLock::new(HashMap::new()), default }
    }

    pub async fn register(&self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) {
        self.backends.write().await.insert(name.into(), backend);
    }

    pub async fn get(&self, name: Option<&str>) -> Arc<dyn CacheBackend> {
        match name {
            Some(name) => self.backends.read().await.get(name).cloned().unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }
}

/// Deterministic cache key for a module invocation: SHA-256 over
/// `moduleName || canonicalJson(inputs) || version`.
pub fn module_cache_key(module_name: &str, inputs: &CValue, version: &str) -> ContentHash {
    let inputs_json = serde_json::to_value(inputs).unwrap_or(serde_json::Value::Null);
    let canonical = crate::content_hash::canonical_json(&inputs_json);
    ContentHash::from_parts([module_name.as_bytes(), b"|", canonical.as_bytes(), b"|", version.as_bytes()])
}

/// In-memory-only cache of compile results, keyed by pipeline name.
/// Validates the stored `(sourceHash, registryHash)` pair against the
/// current one before returning a hit, per spec.md §4.5/§9 (a real
/// compiler's `LoadedPipeline` may carry closures, so this cache is never
/// persisted to disk).
pub struct CompilationCache {
    entries: RwLock<HashMap<String, CompilationCacheEntry>>,
}

struct CompilationCacheEntry {
    source_hash: ContentHash,
    registry_hash: ContentHash,
    loaded_pipeline: crate::pipeline::LoadedPipeline,
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn get(
        &self,
        dag_name: &str,
        source_hash: &ContentHash,
        registry_hash: &ContentHash,
    ) -> Option<crate::pipeline::LoadedPipeline> {
        let entries = self.entries.read().await;
        let entry = entries.get(dag_name)?;
        if &entry.source_hash == source_hash && &entry.registry_hash == registry_hash {
            Some(entry.loaded_pipeline.clone())
        } else {
            None
        }
    }

    pub async fn put(
        &self,
        dag_name: impl Into<String>,
        source_hash: ContentHash,
        registry_hash: ContentHash,
        loaded_pipeline: crate::pipeline::LoadedPipeline,
    ) {
        self.entries.write().await.insert(dag_name.into(), CompilationCacheEntry { source_hash, registry_hash, loaded_pipeline });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = InMemoryCacheBackend::new(10);
        let key = ContentHash::from_bytes(b"k1");
        cache.set(key.clone(), CValue::Int64(42), None).await;
        assert_eq!(cache.get(&key).await, Some(CValue::Int64(42)));
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = InMemoryCacheBackend::new(10);
        let key = ContentHash::from_bytes(b"k1");
        cache.set(key.clone(), CValue::Int64(1), Some(Duration::from_millis(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn lru_eviction_drops_least_recently_used() {
        let cache = InMemoryCacheBackend::new(2);
        let k1 = ContentHash::from_bytes(b"k1");
        let k2 = ContentHash::from_bytes(b"k2");
        let k3 = ContentHash::from_bytes(b"k3");
        cache.set(k1.clone(), CValue::Int64(1), None).await;
        cache.set(k2.clone(), CValue::Int64(2), None).await;
        // touch k1 so it's more-recently-used than k2
        cache.get(&k1).await;
        cache.set(k3.clone(), CValue::Int64(3), None).await;
        assert!(cache.get(&k2).await.is_none());
        assert!(cache.get(&k1).await.is_some());
    }

    #[tokio::test]
    async fn get_or_compute_only_computes_once_on_hit_path() {
        let cache = InMemoryCacheBackend::new(10);
        let key = ContentHash::from_bytes(b"k1");
        let first = cache.get_or_compute(key.clone(), None, || async { Ok(CValue::Int64(7)) }).await.unwrap();
        assert_eq!(first, CValue::Int64(7));
        let second = cache
            .get_or_compute(key, None, || async { panic!("should not recompute on cache hit") })
            .await
            .unwrap();
        assert_eq!(second, CValue::Int64(7));
    }

    #[tokio::test]
    async fn module_cache_key_is_deterministic() {
        let k1 = module_cache_key("std.add", &CValue::Int64(1), "v1");
        let k2 = module_cache_key("std.add", &CValue::Int64(1), "v1");
        assert_eq!(k1, k2);
    }
}
