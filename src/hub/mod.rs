//! Fan-out Hub
//!
//! Websocket server turning the followed competition tree into one ordered
//! stream of text frames per client.
//!
//! # Endpoints
//!
//! ## Push
//! - `GET /v1/competitions` - Distinct competition activations
//! - `GET /v1/competitions/:id` - Full tree of one competition
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health` - Status with connection count
//!
//! Every connection gets a scope below the hub's shutdown scope. Ending the
//! connection, from either side or by a missed pong, cancels that scope and
//! with it every subscription followed on the connection's behalf.

pub mod connection;
pub mod error;
pub mod flatten;
pub mod handlers;
pub mod health;
pub mod keepalive;
pub mod registry;
pub mod state;

pub use error::HubError;
pub use flatten::Flatten;
pub use keepalive::{KeepaliveConfig, Liveness};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use state::AppState;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Build the hub router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let push_routes = Router::new()
        .route("/competitions", get(handlers::competitions))
        .route("/competitions/:id", get(handlers::competition));

    let health_routes = Router::new()
        .route("/live", get(health::liveness))
        .route("/", get(health::full_health));

    Router::new()
        .nest("/v1", push_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind the configured address and serve until SIGINT/SIGTERM
pub async fn serve(state: AppState) -> Result<(), HubError> {
    let addr = state.config.addr();
    let listener = TcpListener::bind(&addr).await?;
    serve_on(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `signal` completes. The hub's
/// shutdown scope is cancelled when it does, closing every connection.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HubError> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state);

    tracing::info!(address = %listener.local_addr()?, "Hub listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = signal => {}
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
    })
    .await?;

    tracing::info!("Hub shut down gracefully");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
