//! Push Connection
//!
//! Runs one websocket connection: a single writer task owns the sink and
//! serializes every frame and ping, the calling task watches liveness on the
//! read side, and a producer feeds frames. Whichever side ends first cancels
//! the connection scope, which stops the other two.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::keepalive::{self, KeepaliveConfig, Liveness};
use crate::scope::HANDOFF_CAPACITY;

/// Drive `socket` until either peer ends it.
///
/// `produce` receives the frame queue and the connection scope; frames it
/// sends are written in order. When every frame sender is dropped the
/// connection is closed.
pub async fn run<F, Fut>(
    socket: WebSocket,
    remote: SocketAddr,
    keepalive: KeepaliveConfig,
    scope: CancellationToken,
    produce: F,
) where
    F: FnOnce(mpsc::Sender<String>, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sink, mut stream) = socket.split();
    let (frames_tx, frames_rx) = mpsc::channel(HANDOFF_CAPACITY);

    let writer = tokio::spawn(write_frames(sink, frames_rx, keepalive, scope.clone(), remote));
    let producer = tokio::spawn(produce(frames_tx, scope.clone()));

    match keepalive::watch(&mut stream, keepalive.pong_wait, &scope).await {
        Liveness::Closed => tracing::debug!(remote_address = %remote, "Peer closed connection"),
        Liveness::Expired => tracing::debug!(remote_address = %remote, "Pong deadline expired"),
        Liveness::Cancelled => {}
        Liveness::Failed(e) => tracing::debug!(remote_address = %remote, error = %e, "Read failed"),
    }

    scope.cancel();
    for task in [writer, producer] {
        if let Err(e) = task.await {
            tracing::error!(remote_address = %remote, error = %e, "Connection task failed");
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<String>,
    keepalive: KeepaliveConfig,
    scope: CancellationToken,
    remote: SocketAddr,
) {
    let mut pings = interval_at(Instant::now() + keepalive.ping_period, keepalive.ping_period);
    pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            _ = pings.tick() => {
                tracing::trace!(remote_address = %remote, "Writing ping");
                Message::Ping(Vec::new())
            }
            frame = frames.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => {
                    // Producer is done.
                    let _ = timeout(keepalive.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
        };

        match timeout(keepalive.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(remote_address = %remote, error = %e, "Failed to write message");
                break;
            }
            Err(_) => {
                tracing::debug!(remote_address = %remote, "Write deadline exceeded");
                break;
            }
        }
    }

    scope.cancel();
}
