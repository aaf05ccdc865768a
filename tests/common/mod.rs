//! Shared helpers for the HTTP integration suite: building a fully-wired
//! `AppState`/`Router` against a scratch temp directory, and a small
//! request/response convenience layer over `tower::ServiceExt::oneshot`.
//!
//! Grounded in the teacher's `api/server.rs` test module (`test_state`)
//! and its `tests/api_integration.rs` request-building helpers.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use constellation::api::server::build_router;
use constellation::api::AppState;
use constellation::config::Config;

/// Build an `AppState` rooted at a fresh temp directory, with `mutate`
/// applied to the default config before the state is constructed (e.g. to
/// turn on API keys or CORS for a given test). The returned `TempDir` must
/// be kept alive for the duration of the test.
pub async fn state_with(mutate: impl FnOnce(&mut Config)) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store_path = dir.path().join("pipelines").to_string_lossy().to_string();
    config.suspension_store_path = dir.path().join("suspensions").to_string_lossy().to_string();
    mutate(&mut config);
    let state = AppState::new(config).await.unwrap();
    (state, dir)
}

pub async fn test_router() -> (Router, tempfile::TempDir) {
    let (state, dir) = state_with(|_| {}).await;
    (build_router(state), dir)
}

/// `oneshot` a JSON request through `router` as if it arrived from
/// `127.0.0.1`, returning the status and the decoded JSON body
/// (empty-body responses decode as `Value::Null`). The rate-limit
/// middleware extracts `ConnectInfo<SocketAddr>` (normally supplied by
/// `into_make_service_with_connect_info` at bind time), so tests must set
/// it on the request's extensions themselves, same as `api/server.rs`'s
/// own test does.
pub async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth: Option<&str>,
) -> (StatusCode, Value) {
    send_json_from(router, method, uri, body, auth, [127, 0, 0, 1]).await
}

/// Like [`send_json`], but from a caller-chosen source IP — for exercising
/// the per-IP axis of the rate limiter independent of the per-key axis.
pub async fn send_json_from(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth: Option<&str>,
    ip: [u8; 4],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(token) = auth {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
        None => Body::empty(),
    };
    let mut request = builder.body(body).unwrap();
    request.extensions_mut().insert(ConnectInfo(SocketAddr::from((ip, 0))));
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Like [`send_json_from`], but also returns the response headers — used
/// by the rate-limit test to check `Retry-After`.
pub async fn send_json_with_headers(
    router: &Router,
    method: &str,
    uri: &str,
    ip: [u8; 4],
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    request.extensions_mut().insert(ConnectInfo(SocketAddr::from((ip, 0))));
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, value)
}
