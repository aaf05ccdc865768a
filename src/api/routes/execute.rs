//! `POST /execute`: run an already-compiled pipeline, addressed by
//! structural hash or alias name, against fresh inputs.
//!
//! When `ref` names a pipeline with an active canary rollout
//! ([`crate::canary::CanaryRouter`]), the canary's weighted version
//! selection overrides the caller's ref for which image actually runs, and
//! the outcome is recorded back against that rollout (spec.md §4.4: "the
//! CanaryRouter sits in front of execution").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::common::{respond, RunResponse};
use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::canary::CanaryStatus;
use crate::content_hash::ContentHash;
use crate::error::ConstellationError;
use crate::pipeline::PipelineImage;
use crate::runtime::ExecutionOptions;
use crate::value::CValue;

pub fn routes() -> Router<AppState> {
    Router::new().route("/execute", post(execute))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(rename = "ref")]
    pipeline_ref: String,
    #[serde(default)]
    inputs: BTreeMap<String, CValue>,
    #[serde(default)]
    options: ExecuteOptions,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExecuteOptions {
    allow_suspend: Option<bool>,
    deadline_secs: Option<u64>,
}

async fn execute(State(state): State<AppState>, Json(req): Json<ExecuteRequest>) -> Result<Json<RunResponse>, Response> {
    let canary_version = state.canary.select_version(&req.pipeline_ref).await;
    let image = match canary_version {
        Some(version) => {
            let hash = state
                .version_store
                .hash_for_version(&req.pipeline_ref, version)
                .ok_or_else(|| error_response(ConstellationError::PipelineNotFound(req.pipeline_ref.clone())))?;
            state
                .pipeline_store
                .inner()
                .get(&hash)
                .ok_or_else(|| error_response(ConstellationError::PipelineChanged(hash.to_string())))?
        }
        None => resolve_pipeline(&state, &req.pipeline_ref).map_err(error_response)?,
    };
    let deadline = req
        .options
        .deadline_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(state.config.execution_timeout_secs));

    let options = ExecutionOptions {
        allow_suspend: req.options.allow_suspend.unwrap_or(true),
        deadline: Some(deadline),
        cache: None,
        cache_version: "v1".to_string(),
    };

    let started = Instant::now();
    let outcome = state.runtime.run(&image, req.inputs, &options, CancellationToken::new()).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    if let Some(version) = canary_version {
        let success = outcome.is_ok();
        if let Some(transition) = state.canary.record_result(&req.pipeline_ref, version, latency_ms, success).await {
            if transition.status == CanaryStatus::Complete {
                if let Some(new_version) = transition.newly_active_version {
                    let _ = state.version_store.set_active_version(&req.pipeline_ref, new_version);
                }
            }
        }
    }

    let outcome = outcome.map_err(error_response)?;
    respond(&state, &image, outcome, None).await
}

fn resolve_pipeline(state: &AppState, pipeline_ref: &str) -> Result<Arc<PipelineImage>, ConstellationError> {
    if let Ok(hash) = ContentHash::from_hex(pipeline_ref) {
        if let Some(image) = state.pipeline_store.inner().get(&hash) {
            return Ok(image);
        }
    }
    state
        .pipeline_store
        .inner()
        .get_by_name(pipeline_ref)
        .ok_or_else(|| ConstellationError::PipelineNotFound(pipeline_ref.to_string()))
}
