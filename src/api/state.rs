//! `AppState`: the single collaborator every HTTP handler depends on.
//!
//! Grounded in the teacher's `api/state.rs` `AppState`/`ServerConfig`
//! pattern — a `#[derive(Clone)]` struct of `Arc<_>` fields built once at
//! startup and threaded through `axum::Router::with_state`.

use std::sync::Arc;

use crate::cache::{CacheRegistry, CompilationCache, InMemoryCacheBackend};
use crate::canary::{CanaryConfig, CanaryRouter};
use crate::config::{AuthConfig, Config};
use crate::error::ConstellationError;
use crate::execution_storage::ExecutionStorage;
use crate::module::{builtins, ModuleRegistry};
use crate::pipeline::{PipelineCompiler, ToyCompiler};
use crate::ratelimit::{RateLimit, RateLimiter};
use crate::runtime::suspension::FileSystemSuspensionStore;
use crate::runtime::Runtime;
use crate::store::{FileSystemPipelineStore, PipelineVersionStore};

#[cfg(feature = "metrics")]
use crate::metrics::ConstellationMetrics;

/// Shared application state, cloned (cheaply, via `Arc`) into every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthConfig>,
    pub registry: Arc<ModuleRegistry>,
    pub compiler: Arc<dyn PipelineCompiler>,
    pub pipeline_store: Arc<FileSystemPipelineStore>,
    pub version_store: Arc<PipelineVersionStore>,
    pub compilation_cache: Arc<CompilationCache>,
    pub cache_registry: Arc<CacheRegistry>,
    pub runtime: Arc<Runtime>,
    pub canary: Arc<CanaryRouter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub executions: Arc<ExecutionStorage>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<ConstellationMetrics>>,
}

impl AppState {
    /// Build the full application state from `config`: opens the
    /// filesystem-backed pipeline and suspension stores (creating their
    /// directories if absent), parses API keys, and wires every subsystem
    /// together. Fallible because opening the durable stores does I/O.
    pub async fn new(config: Config) -> Result<Self, ConstellationError> {
        let registry = Arc::new(ModuleRegistry::new());
        builtins::register_all(&registry);

        let pipeline_store = Arc::new(FileSystemPipelineStore::open(&config.store_path, &registry).await?);
        let suspensions = Arc::new(FileSystemSuspensionStore::open(&config.suspension_store_path).await?);

        let auth = Arc::new(AuthConfig::parse(&config.api_keys_spec)?);
        let cache_backend = Arc::new(InMemoryCacheBackend::new(config.cache_max_entries));
        let cache_registry = Arc::new(CacheRegistry::new(cache_backend));

        let ip_limit = RateLimit { requests_per_second: config.rate_limit_rpm / 60.0, burst_capacity: config.rate_limit_burst as u64 };
        let key_limit = RateLimit {
            requests_per_second: config.rate_limit_per_key_rps,
            burst_capacity: (config.rate_limit_per_key_rps as u64).max(1),
        };

        #[cfg(feature = "metrics")]
        let metrics = ConstellationMetrics::new().ok().map(Arc::new);

        Ok(Self {
            version_store: Arc::new(PipelineVersionStore::new(config.max_versions_per_pipeline)),
            compilation_cache: Arc::new(CompilationCache::new()),
            runtime: Arc::new(Runtime::new(suspensions)),
            canary: Arc::new(CanaryRouter::new(CanaryConfig::default())),
            rate_limiter: Arc::new(RateLimiter::new(ip_limit, key_limit)),
            executions: ExecutionStorage::new(config.execution_history_capacity, config.execution_history_capacity),
            compiler: Arc::new(ToyCompiler::new(registry.clone())),
            pipeline_store,
            registry,
            auth,
            cache_registry,
            config: Arc::new(config),
            #[cfg(feature = "metrics")]
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_defaults_in_a_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store_path = dir.path().join("pipelines").to_string_lossy().to_string();
        config.suspension_store_path = dir.path().join("suspensions").to_string_lossy().to_string();
        let state = AppState::new(config).await.unwrap();
        assert!(state.registry.get("std.add").is_some());
    }
}
