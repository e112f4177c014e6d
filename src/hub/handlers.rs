//! Push Endpoints
//!
//! - GET /v1/competitions - activation of every distinct competition seen in
//!   the history window, once each
//! - GET /v1/competitions/:id - the full followed tree of one competition

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection;
use super::error::HubError;
use super::flatten::Flatten;
use super::state::AppState;
use crate::events::Signal;
use crate::follower::Follower;
use crate::scope::send_scoped;

/// GET /v1/competitions
pub async fn competitions(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.registry.is_full().await {
        return HubError::TooManyConnections.into_response();
    }
    ws.on_upgrade(move |socket| {
        handle_socket(
            socket,
            remote,
            state,
            "/v1/competitions".to_string(),
            stream_competition_list,
        )
    })
}

/// GET /v1/competitions/:id
pub async fn competition(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.registry.is_full().await {
        return HubError::TooManyConnections.into_response();
    }
    let endpoint = format!("/v1/competitions/{}", id);
    ws.on_upgrade(move |socket| {
        handle_socket(socket, remote, state, endpoint, move |state, frames, scope| {
            stream_competition(state, id, frames, scope)
        })
    })
}

async fn handle_socket<F, Fut>(
    socket: WebSocket,
    remote: SocketAddr,
    state: Arc<AppState>,
    endpoint: String,
    produce: F,
) where
    F: FnOnce(Arc<AppState>, mpsc::Sender<String>, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let connection_id = match state.registry.register(remote, endpoint).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(remote_address = %remote, error = %e, "Refused connection");
            return;
        }
    };

    let scope = state.shutdown.child_token();
    let keepalive = state.config.keepalive();
    let producer_state = Arc::clone(&state);
    connection::run(socket, remote, keepalive, scope, move |frames, scope| {
        produce(producer_state, frames, scope)
    })
    .await;

    state.registry.unregister(&connection_id).await;
}

/// Write each distinct competition's activation once. Later activations of
/// an identity already written are skipped, as are deactivations.
async fn stream_competition_list(
    state: Arc<AppState>,
    frames: mpsc::Sender<String>,
    scope: CancellationToken,
) {
    let mut activations = match state
        .source
        .competition_activations(&scope, state.config.history())
        .await
    {
        Ok(activations) => activations,
        Err(e) => {
            tracing::error!(error = %e, "Failed to follow competition activations");
            return;
        }
    };

    let mut sent = HashSet::new();
    loop {
        let signal = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            signal = activations.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Signal::Activated(activation) = signal else {
            continue;
        };
        if sent.contains(&activation.competition_id) {
            continue;
        }
        let competition_id = activation.competition_id.clone();
        if !send_scoped(&frames, activation.raw, &scope).await {
            break;
        }
        sent.insert(competition_id);
    }
}

/// Follow one competition and write its whole tree
async fn stream_competition(
    state: Arc<AppState>,
    competition_id: String,
    frames: mpsc::Sender<String>,
    scope: CancellationToken,
) {
    let follower = Follower::new(state.source.clone());
    let filter = [competition_id];
    let mut competitions = match follower.run(&scope, state.config.history(), &filter).await {
        Ok(competitions) => competitions,
        Err(e) => {
            tracing::error!(competition_id = %filter[0], error = %e, "Failed to run follower");
            return;
        }
    };

    loop {
        let competition = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            competition = competitions.recv() => match competition {
                Some(competition) => competition,
                None => break,
            },
        };
        competition.spawn_flatten(frames.clone(), scope.clone());
    }
}
