//! Replay
//!
//! Serves a recording to every websocket client that connects, on any path.
//! Each client gets the whole file from the start, with the recorded gaps
//! between frames divided by the speed factor. The connection is closed
//! after the last frame.

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::format::decode_line;
use super::{RecorderError, RecorderResult};
use crate::hub::{connection, KeepaliveConfig};
use crate::scope::send_scoped;

/// Shared state of the replay server
#[derive(Debug, Clone)]
pub struct ReplayState {
    pub file: PathBuf,
    pub speed: u32,
    pub keepalive: KeepaliveConfig,
    pub shutdown: CancellationToken,
}

impl ReplayState {
    pub fn new(file: impl Into<PathBuf>, speed: u32, keepalive: KeepaliveConfig) -> Self {
        Self {
            file: file.into(),
            speed,
            keepalive,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Wait before sending a frame recorded at `current` after one recorded at
/// `previous`. The first frame goes out at once; time going backwards
/// counts as no wait.
pub fn replay_delay(previous: Option<DateTime<Utc>>, current: DateTime<Utc>, speed: u32) -> Duration {
    let Some(previous) = previous else {
        return Duration::ZERO;
    };
    let gap = current
        .signed_duration_since(previous)
        .to_std()
        .unwrap_or(Duration::ZERO);
    gap / speed.max(1)
}

pub fn build_router(state: ReplayState) -> Router {
    Router::new()
        .route("/", get(replay_handler))
        .fallback(replay_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve on an already bound listener until `signal` completes
pub async fn serve_on(
    listener: TcpListener,
    state: ReplayState,
    signal: impl Future<Output = ()> + Send + 'static,
) -> RecorderResult<()> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    tracing::info!(address = %listener.local_addr()?, "Replay server listening");

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
    Ok(())
}

async fn replay_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ReplayState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        tracing::info!(remote_address = %remote, "Client connected");
        let scope = state.shutdown.child_token();
        let keepalive = state.keepalive;
        let file = state.file.clone();
        let speed = state.speed;
        connection::run(socket, remote, keepalive, scope, move |frames, scope| async move {
            if let Err(e) = replay_file(file, speed, frames, scope).await {
                tracing::error!(remote_address = %remote, error = %e, "Replay failed");
            }
        })
        .await;
        tracing::info!(remote_address = %remote, "Client disconnected");
    })
}

/// Send every frame of the recording in file order
async fn replay_file(
    path: PathBuf,
    speed: u32,
    frames: mpsc::Sender<String>,
    scope: CancellationToken,
) -> RecorderResult<()> {
    let mut lines = BufReader::new(File::open(&path).await?).lines();
    let mut previous = None;
    let mut number = 0;

    while let Some(line) = lines.next_line().await? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let frame = decode_line(&line).map_err(|error| RecorderError::Line { line: number, error })?;

        let wait = replay_delay(previous, frame.time, speed);
        previous = Some(frame.time);
        if !wait.is_zero() {
            tracing::debug!(wait = ?wait, "Waiting to send next frame");
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(line = number, "Writing frame");
        if !send_scoped(&frames, frame.payload, &scope).await {
            return Ok(());
        }
    }

    tracing::info!(lines = number, "Replay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 2, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_first_frame_has_no_delay() {
        assert_eq!(replay_delay(None, at(5000), 1), Duration::ZERO);
    }

    #[test]
    fn test_delay_is_divided_by_speed() {
        assert_eq!(replay_delay(Some(at(0)), at(3000), 1), Duration::from_secs(3));
        assert_eq!(replay_delay(Some(at(0)), at(3000), 4), Duration::from_millis(750));
    }

    #[test]
    fn test_backwards_time_means_no_delay() {
        assert_eq!(replay_delay(Some(at(3000)), at(1000), 1), Duration::ZERO);
    }

    #[test]
    fn test_zero_speed_is_treated_as_one() {
        assert_eq!(replay_delay(Some(at(0)), at(200), 0), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_replay_file_sends_payloads_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"_time":"2020-02-01T10:00:00Z","typeName":"A"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"_time":"2020-02-01T10:00:00.040Z","typeName":"B"}}"#).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let scope = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(replay_file(file.path().to_path_buf(), 2, tx, scope));

        assert_eq!(rx.recv().await.unwrap(), r#"{"typeName":"A"}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"typeName":"B"}"#);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(rx.recv().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replay_file_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"_time":"2020-02-01T10:00:00Z","typeName":"A"}}"#).unwrap();
        writeln!(file, "garbage").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(replay_file(
            file.path().to_path_buf(),
            1,
            tx,
            CancellationToken::new(),
        ));
        assert!(rx.recv().await.is_some());
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RecorderError::Line { line: 2, .. })));
    }

    #[tokio::test]
    async fn test_replay_stops_on_cancel() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"_time":"2020-02-01T10:00:00Z","typeName":"A"}}"#).unwrap();
        writeln!(file, r#"{{"_time":"2020-02-01T11:00:00Z","typeName":"B"}}"#).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let scope = CancellationToken::new();
        let task = tokio::spawn(replay_file(file.path().to_path_buf(), 1, tx, scope.clone()));
        assert!(rx.recv().await.is_some());

        scope.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
