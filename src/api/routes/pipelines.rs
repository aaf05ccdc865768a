//! `GET /pipelines`, `GET /pipelines/{name}`, `DELETE /pipelines/{hash}`
//! (Admin-gated by the role middleware, since `DELETE` only passes
//! `ApiRole::Admin`'s gate).

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Serialize;

use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::content_hash::ContentHash;
use crate::error::ConstellationError;
use crate::store::PipelineVersion;
use crate::value::CType;

pub fn routes() -> Router<AppState> {
    Router::new().route("/pipelines", get(list)).route("/pipelines/:id", get(get_one).delete(remove))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineSummary {
    name: String,
    structural_hash: String,
    active_version: Option<u64>,
}

async fn list(State(state): State<AppState>) -> Json<Vec<PipelineSummary>> {
    let summaries = state
        .pipeline_store
        .inner()
        .list_aliases()
        .into_iter()
        .map(|(name, hash)| {
            let active_version = state.version_store.active_version(&name).map(|v| v.version);
            PipelineSummary { name, structural_hash: hash.to_string(), active_version }
        })
        .collect();
    Json(summaries)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineDetail {
    name: String,
    structural_hash: String,
    inputs: BTreeMap<String, CType>,
    outputs: Vec<String>,
    versions: Vec<PipelineVersion>,
}

async fn get_one(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<PipelineDetail>, Response> {
    let hash = state
        .pipeline_store
        .inner()
        .resolve(&name)
        .ok_or_else(|| ConstellationError::PipelineNotFound(name.clone()))
        .map_err(error_response)?;
    let image = state
        .pipeline_store
        .inner()
        .get(&hash)
        .ok_or_else(|| ConstellationError::PipelineNotFound(name.clone()))
        .map_err(error_response)?;

    Ok(Json(PipelineDetail {
        name: name.clone(),
        structural_hash: hash.to_string(),
        inputs: image.dag_spec.inputs.iter().cloned().collect(),
        outputs: image.dag_spec.outputs.keys().cloned().collect(),
        versions: state.version_store.list_versions(&name),
    }))
}

async fn remove(State(state): State<AppState>, Path(hash_str): Path<String>) -> Result<StatusCode, Response> {
    let hash = ContentHash::from_hex(&hash_str).map_err(error_response)?;
    let removed = state.pipeline_store.remove(&hash).await.map_err(error_response)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_response(ConstellationError::PipelineNotFound(hash_str)))
    }
}
