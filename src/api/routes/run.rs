//! `POST /run`: compile source, store the resulting image, and execute it
//! immediately. The all-in-one convenience endpoint for callers that don't
//! want to separately manage compiled pipeline images.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use super::common::{registry_fingerprint, run_and_respond, RunResponse};
use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::content_hash::ContentHash;
use crate::pipeline::PipelineImage;
use crate::value::CValue;

pub fn routes() -> Router<AppState> {
    Router::new().route("/run", post(run))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    source: String,
    #[serde(default)]
    inputs: BTreeMap<String, CValue>,
    dag_name: Option<String>,
    allow_suspend: Option<bool>,
}

async fn run(State(state): State<AppState>, Json(req): Json<RunRequest>) -> Result<Json<RunResponse>, Response> {
    let loaded = state.compiler.compile(&req.source).await.map_err(error_response)?;
    let syntactic_hash = ContentHash::from_bytes(req.source.as_bytes());
    let image =
        PipelineImage::new(loaded.dag_spec, Some(syntactic_hash.clone()), &state.registry).map_err(error_response)?;

    let registry_hash = registry_fingerprint(&state.registry);
    let stored_hash = state.pipeline_store.store(image.clone()).await.map_err(error_response)?;
    state
        .pipeline_store
        .index_syntactic(&syntactic_hash, &registry_hash, &stored_hash)
        .await
        .map_err(error_response)?;

    if let Some(name) = &req.dag_name {
        state.pipeline_store.alias(name, &stored_hash).await.map_err(error_response)?;
        state.version_store.record_version(name, &stored_hash, Some(req.source.clone()));
    }

    run_and_respond(&state, &image, req.inputs, req.allow_suspend.unwrap_or(true)).await
}
