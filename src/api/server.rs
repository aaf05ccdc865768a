//! Assembling `AppState` into a running HTTP service.
//!
//! Grounded in the teacher's `api/server.rs` `ApiServer`/`ApiConfig`
//! (`build_router`'s fixed middleware layering, `run`/`run_until`, the
//! `RequestBodyLimitLayer` applied outermost) adapted to this crate's own
//! middleware set (auth+role gate, rate limit, CORS, request id, metrics)
//! in place of the teacher's package-registry-specific layers.

use std::net::SocketAddr;

use axum::{middleware, Router};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

use crate::api::{middleware as mw, routes, AppState};
use crate::error::ConstellationError;

/// Build the complete router: routes nested under `with_state`, wrapped in
/// the middleware stack in the teacher's documented order (layers listed
/// first are applied last, i.e. run closest to the response).
pub fn build_router(state: AppState) -> Router {
    let router = routes::api_router(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), mw::rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), mw::auth))
        .layer(middleware::from_fn(mw::request_id));

    #[cfg(feature = "metrics")]
    let router = router.layer(middleware::from_fn_with_state(state.clone(), mw::metrics));

    router.layer(mw::cors_layer(&state.config.cors_origins)).layer(RequestBodyLimitLayer::new(state.config.max_body_size))
}

/// Bind and serve `build_router(state)` on `state.config.bind_addr` until
/// the process is killed. Graceful shutdown is left to the caller (the CLI
/// binary wires `tokio::signal::ctrl_c` around this).
pub async fn serve(state: AppState) -> Result<(), ConstellationError> {
    let addr: SocketAddr = state
        .config
        .bind_addr
        .parse()
        .map_err(|e| ConstellationError::Internal(format!("invalid bind_addr: {e}")))?;
    let router = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "constellation listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ConstellationError::Internal(format!("server error: {e}")))?;
    Ok(())
}

/// Like [`serve`], but stops once `shutdown` resolves (graceful: in-flight
/// requests finish, no new connections are accepted).
pub async fn serve_until<F>(state: AppState, shutdown: F) -> Result<(), ConstellationError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = state
        .config
        .bind_addr
        .parse()
        .map_err(|e| ConstellationError::Internal(format!("invalid bind_addr: {e}")))?;
    let router = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "constellation listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ConstellationError::Internal(format!("server error: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::default();
        config.store_path = dir.path().join("pipelines").to_string_lossy().to_string();
        config.suspension_store_path = dir.path().join("suspensions").to_string_lossy().to_string();
        AppState::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn health_live_is_reachable_through_the_full_stack() {
        let router = build_router(test_state().await);
        let mut request = Request::builder().uri("/health/live").body(Body::empty()).unwrap();
        request.extensions_mut().insert(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
