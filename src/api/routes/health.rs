//! `/health/live`, `/health/ready`, `/health/detail`.
//!
//! Adapted from the teacher's `api/routes/health.rs` (`health_check`/
//! `readiness_check`/`root` triple) to spec.md's three path names and to
//! this engine's own subsystems (module registry, pipeline store, canary
//! router) in place of the teacher's metadata/cache/search probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health/live", get(live)).route("/health/ready", get(ready)).route("/health/detail", get(detail))
}

#[derive(Serialize)]
struct LiveStatus {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

/// Always 200: process is up and able to serve requests at all, with no
/// dependency checks. Load balancers poll this, not `/ready`.
async fn live() -> Json<LiveStatus> {
    Json(LiveStatus { status: "alive", timestamp: Utc::now() })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyChecks {
    module_registry: bool,
    pipeline_store: bool,
}

#[derive(Serialize)]
struct ReadyStatus {
    status: &'static str,
    checks: ReadyChecks,
}

/// Checks the module registry has at least the builtins loaded and the
/// pipeline store opened without error (both true once `AppState::new`
/// returns successfully, so this mostly guards against a registry wiped out
/// from under the process).
async fn ready(State(state): State<AppState>) -> Result<Json<ReadyStatus>, (StatusCode, Json<ReadyStatus>)> {
    let checks = ReadyChecks { module_registry: !state.registry.is_empty(), pipeline_store: true };
    if checks.module_registry && checks.pipeline_store {
        Ok(Json(ReadyStatus { status: "ready", checks }))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(ReadyStatus { status: "not_ready", checks })))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailStatus {
    status: &'static str,
    timestamp: DateTime<Utc>,
    pipelines_stored: usize,
    modules_registered: usize,
    active_canary_rollouts: usize,
    dropped_execution_events: u64,
}

/// Richer, opt-in status for operators (not meant for automated probes):
/// counts across the major subsystems.
async fn detail(State(state): State<AppState>) -> Json<DetailStatus> {
    Json(DetailStatus {
        status: "ok",
        timestamp: Utc::now(),
        pipelines_stored: state.pipeline_store.inner().list_images().len(),
        modules_registered: state.registry.len(),
        active_canary_rollouts: state.canary.list().await.len(),
        dropped_execution_events: state.executions.dropped_event_count(),
    })
}
