//! `GET /executions`, `GET /executions/{id}`, `POST /executions/{id}/resume`,
//! `DELETE /executions/{id}`: listing, inspecting, resuming, and discarding
//! suspended executions (spec.md §6.1); `GET /executions/stream` is the
//! ambient-stack WebSocket fan-out of execution lifecycle events
//! (SPEC_FULL.md §10.5).

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::common::{respond, RunResponse};
use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::content_hash::ContentHash;
use crate::dag::NodeId;
use crate::error::ConstellationError;
use crate::runtime::{suspension::SuspensionFilter, ExecutionOptions};
use crate::value::CValue;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list))
        .route("/executions/stream", get(stream))
        .route("/executions/:id", get(get_one).delete(remove))
        .route("/executions/:id/resume", post(resume))
}

/// Upgrades to a WebSocket and forwards every [`crate::execution_storage::ExecutionEvent`]
/// as a JSON text frame until the client disconnects. Lagging subscribers
/// drop the oldest unread events (per `broadcast::Receiver` semantics
/// rather than blocking the producer); drops are counted via
/// `ExecutionStorage::note_dropped` and surfaced as
/// `constellation_execution_events_dropped_total`.
async fn stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(mut socket: WebSocket, state: AppState) {
    let mut rx = state.executions.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                state.executions.note_dropped(n);
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &state.metrics {
                    metrics.execution_events_dropped_total.with_label_values(&["lagged"]).inc_by(n as f64);
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[derive(Deserialize, Default)]
struct ListQuery {
    structural_hash: Option<String>,
    missing_input: Option<String>,
}

async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Vec<SuspensionSummaryDto>> {
    let filter = SuspensionFilter {
        structural_hash: query.structural_hash,
        missing_input: query.missing_input,
        ..Default::default()
    };
    let summaries = state.runtime.list_suspensions(&filter).await;
    Json(summaries.into_iter().map(SuspensionSummaryDto::from).collect())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuspensionSummaryDto {
    handle: String,
    structural_hash: String,
    resumption_count: u32,
    missing_inputs: Vec<String>,
    created_at_millis: i64,
}

impl From<crate::runtime::suspension::SuspensionSummary> for SuspensionSummaryDto {
    fn from(s: crate::runtime::suspension::SuspensionSummary) -> Self {
        Self {
            handle: s.handle,
            structural_hash: s.structural_hash,
            resumption_count: s.resumption_count,
            missing_inputs: s.missing_inputs,
            created_at_millis: s.created_at_millis,
        }
    }
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SuspensionSummaryDto>, Response> {
    let filter = SuspensionFilter { handle: Some(id.clone()), ..Default::default() };
    state
        .runtime
        .list_suspensions(&filter)
        .await
        .into_iter()
        .next()
        .map(|s| Json(SuspensionSummaryDto::from(s)))
        .ok_or_else(|| error_response(ConstellationError::SuspensionNotFound(id)))
}

async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, Response> {
    if state.runtime.delete_suspension(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_response(ConstellationError::SuspensionNotFound(id)))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeRequest {
    #[serde(default)]
    additional_inputs: BTreeMap<String, CValue>,
    #[serde(default)]
    resolved_nodes: BTreeMap<NodeId, CValue>,
    #[serde(default)]
    options: ResumeOptions,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResumeOptions {
    allow_suspend: Option<bool>,
    deadline_secs: Option<u64>,
}

/// Resumes a suspension, recording the outcome under its original handle
/// (see `common::run_and_respond_with_deadline`'s `id_hint` doc comment).
async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<RunResponse>, Response> {
    let suspension = state
        .runtime
        .get_suspension(&id)
        .await
        .ok_or_else(|| error_response(ConstellationError::SuspensionNotFound(id.clone())))?;

    let structural_hash = ContentHash::from_hex(&suspension.structural_hash).map_err(error_response)?;
    let image = state
        .pipeline_store
        .inner()
        .get(&structural_hash)
        .ok_or_else(|| error_response(ConstellationError::PipelineChanged(suspension.structural_hash.clone())))?;

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

    let outcome = state
        .runtime
        .resume(&id, state.pipeline_store.inner(), req.additional_inputs, req.resolved_nodes, &options, CancellationToken::new())
        .await
        .map_err(error_response)?;

    respond(&state, &image, outcome, Some(id)).await
}
