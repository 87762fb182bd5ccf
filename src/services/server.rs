//! HTTP server for the change request API.
//!
//! Wires the routes, identity middleware and CORS into one axum router and
//! runs it until a cancellation token fires. On shutdown the automation
//! worker is stopped after in-flight requests have drained.

use crate::services::api::{protected_routes, public_routes};
use crate::services::identity::identity_middleware;
use crate::services::lifecycle::LifecycleEngine;
use axum::middleware;
use axum::Router;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Shared state for the axum routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
}

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    let protected = protected_routes().layer(middleware::from_fn(identity_middleware));

    Router::new()
        .merge(public_routes())
        .merge(protected)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve the API on `addr` until `cancel_token` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<(), std::io::Error> {
    let automation = state.engine.automation().clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("[server] Listening on http://{}", listener.local_addr()?);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
        })
        .await;

    if let Err(e) = &result {
        log::error!("[server] Server error: {}", e);
    }

    automation.stop().await;
    log::info!("[server] Server stopped");
    result
}
