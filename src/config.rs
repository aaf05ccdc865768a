//! Layered configuration: defaults, overridden by a config file, overridden
//! by environment variables, overridden by CLI flags (later layers win).
//!
//! Grounded in the teacher's `CacheConfig::from_env` pattern
//! (`dashflow-registry::cache`, reading named env vars with typed
//! defaults) and `atomic_write_file` (`dashflow::checkpoint`) for the
//! optional `--write-config` round-trip.

use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::path::Path;

use crate::error::ConstellationError;

/// Runtime configuration, covering env vars listed in spec.md §6.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: String,
    pub bind_addr: String,
    pub max_concurrent_executions: usize,
    pub execution_timeout_secs: u64,
    pub cache_max_entries: usize,
    pub suspension_store_path: String,
    pub rate_limit_per_ip_rps: f64,
    pub rate_limit_per_key_rps: f64,
    pub max_versions_per_pipeline: Option<usize>,
    pub execution_history_capacity: usize,
    pub log_format: LogFormat,

    /// `key:role,...` pairs, e.g. `CONSTELLATION_API_KEYS=abc...:admin,def...:readonly`.
    /// Plaintext keys never leave this field; [`AuthConfig::from_env_spec`]
    /// hashes each on load.
    pub api_keys_spec: String,
    pub cors_origins: Vec<String>,
    pub rate_limit_rpm: f64,
    pub rate_limit_burst: u32,
    /// Canary reservoir sample rate (fraction of requests sampled for
    /// latency percentiles), spec.md §4.4.
    pub sample_rate: f64,
    pub max_executions: usize,
    pub dashboard_enabled: bool,
    /// Request body size cap enforced by `RequestBodyLimitLayer`, applied
    /// outermost so oversized bodies are rejected before any other
    /// middleware runs. Matches spec.md §6.5's CLI input-file cap.
    pub max_body_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: "./data/pipelines".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            max_concurrent_executions: 256,
            execution_timeout_secs: 30,
            cache_max_entries: 10_000,
            suspension_store_path: "./data/suspensions".to_string(),
            rate_limit_per_ip_rps: 50.0,
            rate_limit_per_key_rps: 200.0,
            max_versions_per_pipeline: Some(20),
            execution_history_capacity: 1_000,
            log_format: LogFormat::Pretty,
            api_keys_spec: String::new(),
            cors_origins: Vec::new(),
            rate_limit_rpm: 3_000.0,
            rate_limit_burst: 100,
            sample_rate: 1.0,
            max_executions: 1_000,
            dashboard_enabled: false,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load a config file, if present, then apply environment variable
    /// overrides on top.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConstellationError> {
        let mut config = match config_path {
            Some(path) if path.exists() => {
                let data = std::fs::read_to_string(path)?;
                serde_json::from_str(&data)?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("CONSTELLATION_STORE_PATH") {
            self.store_path = v;
        }
        if let Some(v) = env_string("CONSTELLATION_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_usize("CONSTELLATION_MAX_CONCURRENT_EXECUTIONS") {
            self.max_concurrent_executions = v;
        }
        if let Some(v) = env_u64("CONSTELLATION_EXECUTION_TIMEOUT_SECS") {
            self.execution_timeout_secs = v;
        }
        if let Some(v) = env_usize("CONSTELLATION_CACHE_MAX_ENTRIES") {
            self.cache_max_entries = v;
        }
        if let Some(v) = env_string("CONSTELLATION_SUSPENSION_STORE_PATH") {
            self.suspension_store_path = v;
        }
        if let Some(v) = env_f64("CONSTELLATION_RATE_LIMIT_PER_IP_RPS") {
            self.rate_limit_per_ip_rps = v;
        }
        if let Some(v) = env_f64("CONSTELLATION_RATE_LIMIT_PER_KEY_RPS") {
            self.rate_limit_per_key_rps = v;
        }
        if let Some(v) = env_usize("CONSTELLATION_MAX_VERSIONS_PER_PIPELINE") {
            self.max_versions_per_pipeline = Some(v);
        }
        if let Some(v) = env_usize("CONSTELLATION_EXECUTION_HISTORY_CAPACITY") {
            self.execution_history_capacity = v;
        }
        if let Some(v) = env_string("CONSTELLATION_LOG_FORMAT") {
            if v.eq_ignore_ascii_case("json") {
                self.log_format = LogFormat::Json;
            } else if v.eq_ignore_ascii_case("pretty") {
                self.log_format = LogFormat::Pretty;
            }
        }

        // spec.md §6.4's exact env var names.
        if let Some(v) = env_string("CONSTELLATION_PIPELINE_DIR") {
            self.store_path = v;
        }
        if let Some(v) = env_string("CONSTELLATION_CST_DIR") {
            self.suspension_store_path = v;
        }
        if let Some(v) = env_string("CONSTELLATION_API_KEYS") {
            self.api_keys_spec = v;
        }
        if let Some(v) = env_string("CONSTELLATION_CORS_ORIGINS") {
            self.cors_origins = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = env_f64("CONSTELLATION_RATE_LIMIT_RPM") {
            self.rate_limit_rpm = v;
        }
        if let Some(v) = env_string("CONSTELLATION_RATE_LIMIT_BURST").and_then(|v| v.parse().ok()) {
            self.rate_limit_burst = v;
        }
        if let Some(v) = env_f64("CONSTELLATION_SAMPLE_RATE") {
            self.sample_rate = v;
        }
        if let Some(v) = env_usize("CONSTELLATION_MAX_EXECUTIONS") {
            self.max_executions = v;
        }
        if let Some(v) = env_string("CONSTELLATION_DASHBOARD_ENABLED") {
            self.dashboard_enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = env_usize("CONSTELLATION_MAX_BODY_SIZE") {
            self.max_body_size = v;
        }
    }

    /// Persist this configuration atomically (temp file + fsync + rename),
    /// mirroring the durable-write pattern used for pipeline images.
    pub async fn write_to(&self, path: &Path) -> Result<(), ConstellationError> {
        use tokio::io::AsyncWriteExt;
        let bytes = serde_json::to_vec_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

/// A key's authorization level. Ordered weakest-first; `api::middleware`
/// gates HTTP methods against this per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    ReadOnly,
    Execute,
    Admin,
}

impl ApiRole {
    /// Whether a key with this role may invoke an HTTP method.
    pub fn permits(self, method: &http_method::Method) -> bool {
        use http_method::Method;
        match self {
            ApiRole::ReadOnly => matches!(method, Method::Get | Method::Head),
            ApiRole::Execute => !matches!(method, Method::Delete),
            ApiRole::Admin => true,
        }
    }
}

/// HTTP methods the role gate cares about, kept independent of the `axum`
/// feature flag so `ApiRole` is usable without the `server` feature.
pub mod http_method {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Method {
        Get,
        Head,
        Post,
        Put,
        Delete,
        Patch,
    }
}

/// `{ hash: SHA-256(plaintext), role }`. The plaintext is never retained
/// past `AuthConfig::parse`.
#[derive(Debug, Clone)]
pub struct HashedApiKey {
    pub hash: [u8; 32],
    pub role: ApiRole,
}

/// Parsed, hashed API keys ready for constant-time lookup by
/// `api::middleware`.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub keys: Vec<HashedApiKey>,
}

impl AuthConfig {
    /// Parse `CONSTELLATION_API_KEYS`'s `key:role,key:role,...` format.
    ///
    /// Each plaintext key must be at least 32 ASCII characters from
    /// `[A-Za-z0-9_-]` (spec.md §4.6); an empty spec yields an empty
    /// config (auth disabled — every request is treated as `Admin`, matching
    /// the teacher's "no keys configured -> open" local-dev default).
    pub fn parse(spec: &str) -> Result<Self, ConstellationError> {
        let mut keys = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (plaintext, role_str) = entry.split_once(':').ok_or_else(|| {
                ConstellationError::Internal(format!("malformed API key entry (expected key:role): {entry}"))
            })?;
            validate_key_shape(plaintext)?;
            let role = match role_str {
                "readonly" | "read_only" => ApiRole::ReadOnly,
                "execute" => ApiRole::Execute,
                "admin" => ApiRole::Admin,
                other => return Err(ConstellationError::Internal(format!("unknown API role: {other}"))),
            };
            let hash = sha2::Sha256::digest(plaintext.as_bytes()).into();
            keys.push(HashedApiKey { hash, role });
        }
        Ok(Self { keys })
    }
}

fn validate_key_shape(key: &str) -> Result<(), ConstellationError> {
    if key.len() < 32 || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(ConstellationError::Internal(
            "API key must be at least 32 characters from [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_usize(key: &str) -> Option<usize> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_string(key).and_then(|v| v.parse().ok())
}
