//! `/deploy/canary/{name}` start/promote/rollback/status (spec.md §4.4,
//! §6.1). `CanaryRouter` tracks rollouts by version number, while
//! `PipelineStore`/`PipelineVersionStore` address pipelines by name and
//! structural hash; this route bridges the two, recording a version entry
//! for any hash a caller deploys that doesn't have one yet.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::canary::{CanaryConfig, CanaryStatus, CanaryStatusSnapshot};
use crate::content_hash::ContentHash;
use crate::error::ConstellationError;
use crate::store::PipelineVersionStore;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/deploy/canary/:name", post(start).get(status))
        .route("/deploy/canary/:name/promote", post(promote))
        .route("/deploy/canary/:name/rollback", post(rollback))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    old_hash: Option<String>,
    new_hash: String,
    #[serde(default)]
    config: StartConfig,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StartConfig {
    initial_weight: Option<f64>,
    promotion_steps: Option<Vec<f64>>,
    observation_window_secs: Option<u64>,
    error_threshold: Option<f64>,
    latency_threshold_ms: Option<f64>,
    min_requests: Option<u64>,
    auto_promote: Option<bool>,
}

impl StartConfig {
    fn into_canary_config(self) -> CanaryConfig {
        let defaults = CanaryConfig::default();
        CanaryConfig {
            initial_weight: self.initial_weight.unwrap_or(defaults.initial_weight),
            promotion_steps: self.promotion_steps.unwrap_or(defaults.promotion_steps),
            observation_window: self.observation_window_secs.map(Duration::from_secs).unwrap_or(defaults.observation_window),
            error_threshold: self.error_threshold.unwrap_or(defaults.error_threshold),
            latency_threshold_ms: self.latency_threshold_ms.or(defaults.latency_threshold_ms),
            min_requests: self.min_requests.unwrap_or(defaults.min_requests),
            auto_promote: self.auto_promote.unwrap_or(defaults.auto_promote),
        }
    }
}

/// Resolve a structural hash to its recorded version for `name`, recording
/// a new version entry (auto-incrementing) if this exact hash hasn't been
/// versioned under this name before.
fn version_for_hash(versions: &PipelineVersionStore, name: &str, hash: &ContentHash) -> u64 {
    if let Some(existing) = versions.list_versions(name).into_iter().find(|v| v.structural_hash == hash.to_string()) {
        return existing.version;
    }
    versions.record_version(name, hash, None).version
}

async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<Json<CanaryStatusSnapshot>, Response> {
    let new_hash = ContentHash::from_hex(&req.new_hash).map_err(error_response)?;
    let new_version = version_for_hash(&state.version_store, &name, &new_hash);

    let old_version = match &req.old_hash {
        Some(old_hash) => {
            let old_hash = ContentHash::from_hex(old_hash).map_err(error_response)?;
            Some(version_for_hash(&state.version_store, &name, &old_hash))
        }
        None => state.version_store.active_version(&name).map(|v| v.version),
    };

    let rollout = state
        .canary
        .start_with_config(&name, old_version, new_version, req.config.into_canary_config())
        .await
        .map_err(error_response)?;
    Ok(Json(rollout.snapshot().await))
}

async fn status(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CanaryStatusSnapshot>, Response> {
    let rollout = state
        .canary
        .get(&name)
        .await
        .ok_or_else(|| error_response(ConstellationError::PipelineNotFound(name.clone())))?;
    Ok(Json(rollout.snapshot().await))
}

async fn promote(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CanaryStatusSnapshot>, Response> {
    let rollout = state
        .canary
        .get(&name)
        .await
        .ok_or_else(|| error_response(ConstellationError::PipelineNotFound(name.clone())))?;
    let transition = rollout.promote().await;
    if transition.status == CanaryStatus::Complete {
        let _ = state.version_store.set_active_version(&name, rollout.new_version);
    }
    Ok(Json(rollout.snapshot().await))
}

async fn rollback(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CanaryStatusSnapshot>, Response> {
    let rollout = state
        .canary
        .get(&name)
        .await
        .ok_or_else(|| error_response(ConstellationError::PipelineNotFound(name.clone())))?;
    rollout.rollback().await;
    Ok(Json(rollout.snapshot().await))
}
