//! `POST /compile`: compile source into a stored, content-addressed
//! pipeline image without executing it. Hits the syntactic-hash fast path
//! (spec.md §4.5) when the same source has already been compiled against
//! the same module registry.

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::common::registry_fingerprint;
use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::content_hash::ContentHash;
use crate::pipeline::PipelineImage;

pub fn routes() -> Router<AppState> {
    Router::new().route("/compile", post(compile))
}

#[derive(Deserialize)]
struct CompileRequest {
    source: String,
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompileResponse {
    structural_hash: String,
    warnings: Vec<String>,
}

async fn compile(State(state): State<AppState>, Json(req): Json<CompileRequest>) -> Result<Json<CompileResponse>, Response> {
    let syntactic_hash = ContentHash::from_bytes(req.source.as_bytes());
    let registry_hash = registry_fingerprint(&state.registry);

    if let Some(structural) = state.pipeline_store.inner().lookup_syntactic(&syntactic_hash, &registry_hash) {
        if let Some(name) = &req.name {
            state.pipeline_store.alias(name, &structural).await.map_err(error_response)?;
            state.version_store.record_version(name, &structural, Some(req.source.clone()));
        }
        return Ok(Json(CompileResponse { structural_hash: structural.to_string(), warnings: Vec::new() }));
    }

    let loaded = state.compiler.compile(&req.source).await.map_err(error_response)?;
    let image =
        PipelineImage::new(loaded.dag_spec, Some(syntactic_hash.clone()), &state.registry).map_err(error_response)?;
    let structural_hash = state.pipeline_store.store(image).await.map_err(error_response)?;
    state
        .pipeline_store
        .index_syntactic(&syntactic_hash, &registry_hash, &structural_hash)
        .await
        .map_err(error_response)?;

    if let Some(name) = &req.name {
        state.pipeline_store.alias(name, &structural_hash).await.map_err(error_response)?;
        state.version_store.record_version(name, &structural_hash, Some(req.source.clone()));
    }

    Ok(Json(CompileResponse { structural_hash: structural_hash.to_string(), warnings: loaded.warnings }))
}
