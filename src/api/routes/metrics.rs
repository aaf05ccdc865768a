//! `GET /metrics`: Prometheus text exposition, feature-gated behind
//! `metrics`. Grounded in the teacher's `api/routes/metrics.rs`
//! (`prometheus_metrics` handler returning the encoded registry, with a
//! no-op `404` fallback when the feature is compiled out).

#[cfg(feature = "metrics")]
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};

use crate::api::AppState;

#[cfg(feature = "metrics")]
pub fn routes() -> Router<AppState> {
    Router::new().route("/metrics", get(render_metrics))
}

#[cfg(not(feature = "metrics"))]
pub fn routes() -> axum::Router<AppState> {
    use axum::{http::StatusCode, routing::get, Router};
    async fn disabled() -> StatusCode {
        StatusCode::NOT_FOUND
    }
    Router::new().route("/metrics", get(disabled))
}

#[cfg(feature = "metrics")]
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], metrics.render()),
        None => (StatusCode::NOT_FOUND, [("content-type", "text/plain")], "metrics not enabled".to_string()),
    }
}
