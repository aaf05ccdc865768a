//! Request-level safety gates: auth (constant-time key compare + role
//! gate), CORS, dual-axis rate limiting, and request-id tagging.
//!
//! Grounded in the teacher's `api/middleware.rs` (`auth_context_middleware`,
//! `cors_middleware`, `request_id_middleware` — each a `axum::middleware::from_fn`
//! layer composed in `api/server.rs`'s fixed order).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::Digest;

use crate::config::http_method::Method as GateMethod;
use crate::config::ApiRole;
use crate::error::ConstellationError;

use super::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// An authenticated (or anonymously-admitted, when no keys are configured)
/// caller's role, attached to request extensions by [`auth`] for
/// downstream handlers/metrics to read.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub role: ApiRole,
}

/// Byte-for-byte comparison that does not short-circuit on the first
/// mismatch, to avoid leaking key-prefix-match timing. Lengths may differ
/// (an attacker learns nothing from that: key lengths are public — the
/// validation step already rejects sub-32-character keys at load time).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn axum_method_to_gate(method: &axum::http::Method) -> GateMethod {
    match *method {
        axum::http::Method::GET => GateMethod::Get,
        axum::http::Method::HEAD => GateMethod::Head,
        axum::http::Method::POST => GateMethod::Post,
        axum::http::Method::PUT => GateMethod::Put,
        axum::http::Method::DELETE => GateMethod::Delete,
        axum::http::Method::PATCH => GateMethod::Patch,
        _ => GateMethod::Post,
    }
}

fn unauthorized() -> Response {
    error_response(ConstellationError::Unauthorized)
}

fn forbidden() -> Response {
    error_response(ConstellationError::Forbidden)
}

pub fn error_response(err: ConstellationError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::Json(serde_json::json!({
        "kind": err.kind(),
        "message": err.sanitized_message(),
    }));
    (status, body).into_response()
}

/// Health and metrics routes skip auth entirely; they carry no secrets and
/// gating them would break load-balancer/scrape probes.
fn is_public_path(path: &str) -> bool {
    path.starts_with("/health/") || path == "/metrics"
}

/// Extracts `Authorization: Bearer <token>`, hashes it, and compares
/// against every configured key using a constant-time comparator (spec.md
/// §4.6: no early exit on mismatch). With no keys configured, every request
/// is treated as `Admin` (local-dev default, matching the teacher's
/// no-keys-means-open posture).
pub async fn auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if is_public_path(req.uri().path()) {
        return next.run(req).await;
    }
    if state.auth.keys.is_empty() {
        req.extensions_mut().insert(AuthContext { role: ApiRole::Admin });
        return run_role_gate(state, req, next).await;
    }

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized();
    };

    let candidate_hash = sha2::Sha256::digest(token.as_bytes());
    let mut matched_role = None;
    // Compare against every key, not just until the first match, so total
    // request latency doesn't reveal how many keys were tried.
    for key in &state.auth.keys {
        if constant_time_eq(&key.hash, candidate_hash.as_slice()) {
            matched_role = Some(key.role);
        }
    }

    let Some(role) = matched_role else {
        return unauthorized();
    };

    req.extensions_mut().insert(AuthContext { role });
    req.extensions_mut().insert(token.to_string());
    run_role_gate(state, req, next).await
}

async fn run_role_gate(state: AppState, req: Request, next: Next) -> Response {
    let role = req.extensions().get::<AuthContext>().map(|c| c.role).unwrap_or(ApiRole::ReadOnly);
    let gate_method = axum_method_to_gate(req.method());
    if !role.permits(&gate_method) {
        return forbidden();
    }
    let _ = &state;
    next.run(req).await
}

/// Per-IP and (if authenticated) per-key token-bucket admission, per
/// spec.md §4.6/§5. Runs after `auth` so the API key is available.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if is_public_path(req.uri().path()) {
        return next.run(req).await;
    }
    let api_key = req.extensions().get::<String>().cloned();
    match state.rate_limiter.check(&addr.ip().to_string(), api_key.as_deref()).await {
        Ok(()) => next.run(req).await,
        Err(retry_after_secs) => error_response(ConstellationError::RateLimited { retry_after_secs }),
    }
}

/// Attaches an `X-Request-Id` (generated if absent) to the response and to
/// the current tracing span, mirroring the teacher's `request_id_middleware`.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!("http_request", request_id = %id);
    let _enter = span.enter();
    req.extensions_mut().insert(id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Records `constellation_http_requests_total` /
/// `constellation_http_request_duration_seconds`, with path labels
/// cardinality-normalized per SPEC_FULL.md §10.6.
#[cfg(feature = "metrics")]
pub async fn metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = crate::metrics::normalize_path_label(req.uri().path());
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    if let Some(metrics) = &state.metrics {
        let status = response.status().as_u16().to_string();
        metrics.http_requests_total.with_label_values(&[&method, &path, &status]).inc();
        metrics.http_request_duration_seconds.with_label_values(&[&method, &path]).observe(start.elapsed().as_secs_f64());
    }
    response
}

/// CORS layer built from `config.cors_origins`. Empty origins means no
/// cross-origin requests are permitted — never defaults to a wildcard
/// (see `AppState`'s grounding note: security-conscious default, matching
/// the teacher's `ServerConfig::default()`).
pub fn cors_layer(origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::CorsLayer;
    if origins.is_empty() {
        return CorsLayer::new();
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn public_paths_skip_auth() {
        assert!(is_public_path("/health/live"));
        assert!(is_public_path("/metrics"));
        assert!(!is_public_path("/run"));
    }

    #[test]
    fn role_gate_matches_spec_table() {
        assert!(ApiRole::ReadOnly.permits(&GateMethod::Get));
        assert!(!ApiRole::ReadOnly.permits(&GateMethod::Post));
        assert!(ApiRole::Execute.permits(&GateMethod::Post));
        assert!(!ApiRole::Execute.permits(&GateMethod::Delete));
        assert!(ApiRole::Admin.permits(&GateMethod::Delete));
    }
}
