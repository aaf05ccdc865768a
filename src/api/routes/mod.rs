//! HTTP route handlers, organized by resource, mirroring the teacher's
//! `api/routes/mod.rs` `api_router()` — one module per resource, merged
//! into a single `Router<AppState>` here rather than nested under a
//! versioned prefix (spec.md's paths are unversioned, unlike the teacher's
//! `/api/v1`).

mod common;

pub mod canary;
pub mod compile;
pub mod execute;
pub mod executions;
pub mod health;
pub mod metrics;
pub mod pipelines;
pub mod run;

use axum::Router;

use crate::api::AppState;

/// Build the complete, unnested API router: every resource module merged
/// together and bound to `state`.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .merge(run::routes())
        .merge(compile::routes())
        .merge(execute::routes())
        .merge(pipelines::routes())
        .merge(executions::routes())
        .merge(canary::routes())
        .merge(health::routes())
        .merge(metrics::routes())
        .with_state(state)
}
