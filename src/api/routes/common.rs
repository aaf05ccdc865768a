//! Helpers shared by more than one route handler: the compile-cache
//! registry fingerprint, and running a pipeline to completion/suspension
//! and recording the outcome in execution history.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::response::Response;
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::middleware::error_response;
use crate::api::AppState;
use crate::content_hash::ContentHash;
use crate::execution_storage;
use crate::module::ModuleRegistry;
use crate::pipeline::PipelineImage;
use crate::runtime::{ExecutionOptions, ExecutionOutcome};
use crate::value::{CType, CValue};

/// A stand-in for a full module-signature hash. `ModuleRegistry` exposes no
/// way to enumerate registered names, so the compile-cache fast path keys
/// on registry size rather than the set of names actually registered; two
/// registries of equal size but different contents would collide here. See
/// DESIGN.md.
pub(super) fn registry_fingerprint(registry: &ModuleRegistry) -> ContentHash {
    ContentHash::from_bytes(format!("modules:{}", registry.len()).as_bytes())
}

/// The `POST /run` and `POST /execute` response body: `status` discriminates
/// between a completed run (with its outputs) and a suspended one (with the
/// handle needed to resume it).
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub(super) enum RunResponse {
    #[serde(rename = "completed")]
    Completed {
        outputs: BTreeMap<String, CValue>,
        structural_hash: String,
    },
    #[serde(rename = "suspended")]
    Suspended {
        execution_id: String,
        missing_inputs: BTreeMap<String, CType>,
        pending_outputs: Vec<String>,
        resumption_count: u32,
    },
}

/// Run `image` against `inputs` using the service's default deadline
/// (`config.execution_timeout_secs`).
pub(super) async fn run_and_respond(
    state: &AppState,
    image: &PipelineImage,
    inputs: BTreeMap<String, CValue>,
    allow_suspend: bool,
) -> Result<Json<RunResponse>, Response> {
    let deadline = Duration::from_secs(state.config.execution_timeout_secs);
    run_and_respond_with_deadline(state, image, inputs, allow_suspend, deadline, None).await
}

/// Run `image` against `inputs` with an explicit deadline. `id_hint`, when
/// set, is the execution id a completed run's history entry should be
/// recorded under (used by resume, to keep recording under the original
/// suspension handle rather than minting a fresh id); a suspended outcome
/// always uses its own newly (or previously) assigned handle regardless of
/// `id_hint`.
pub(super) async fn run_and_respond_with_deadline(
    state: &AppState,
    image: &PipelineImage,
    inputs: BTreeMap<String, CValue>,
    allow_suspend: bool,
    deadline: Duration,
    id_hint: Option<String>,
) -> Result<Json<RunResponse>, Response> {
    let options = ExecutionOptions { allow_suspend, deadline: Some(deadline), cache: None, cache_version: "v1".to_string() };
    let cancel = CancellationToken::new();

    let outcome = state.runtime.run(image, inputs, &options, cancel).await.map_err(error_response)?;
    respond(state, image, outcome, id_hint).await
}

/// Package an [`ExecutionOutcome`] already produced by `Runtime::run` or
/// `Runtime::resume` into the HTTP response shape, recording it in
/// [`crate::execution_storage::ExecutionStorage`] along the way.
pub(super) async fn respond(
    state: &AppState,
    image: &PipelineImage,
    outcome: ExecutionOutcome,
    id_hint: Option<String>,
) -> Result<Json<RunResponse>, Response> {
    match outcome {
        ExecutionOutcome::Completed { outputs } => {
            let execution_id = id_hint.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            state.executions.record_started(&execution_id, &image.structural_hash).await;
            state
                .executions
                .record_finished(&execution_id, execution_storage::ExecutionOutcome::Succeeded { outputs: outputs.clone() })
                .await;
            Ok(Json(RunResponse::Completed { outputs, structural_hash: image.structural_hash.to_string() }))
        }
        ExecutionOutcome::Suspended(descriptor) => {
            state.executions.record_started(&descriptor.handle, &image.structural_hash).await;
            state
                .executions
                .record_finished(
                    &descriptor.handle,
                    execution_storage::ExecutionOutcome::Suspended { handle: descriptor.handle.clone() },
                )
                .await;
            Ok(Json(RunResponse::Suspended {
                execution_id: descriptor.handle,
                missing_inputs: descriptor.missing_inputs,
                pending_outputs: descriptor.pending_outputs,
                resumption_count: descriptor.resumption_count,
            }))
        }
    }
}
