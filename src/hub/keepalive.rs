//! Connection Keepalive
//!
//! The writer pings every `ping_period`; the reader side waits for pongs.
//! A connection that has not acknowledged a ping within `pong_wait` is
//! considered dead.

use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Keepalive timing of a push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between pings
    pub ping_period: Duration,
    /// Read-liveness deadline, refreshed by every pong
    pub pong_wait: Duration,
    /// Deadline for writing one frame
    pub write_wait: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            ping_period: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
        }
    }
}

/// Why the read side of a connection stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// The peer closed the connection
    Closed,
    /// No pong within the deadline
    Expired,
    /// The connection scope was cancelled
    Cancelled,
    /// Reading failed
    Failed(String),
}

/// Read from `stream` until the peer goes away, stops answering pings or
/// the scope is cancelled. Frames other than pongs and close are discarded.
pub async fn watch<S, E>(stream: &mut S, pong_wait: Duration, scope: &CancellationToken) -> Liveness
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return Liveness::Cancelled,
            _ = &mut deadline => return Liveness::Expired,
            message = stream.next() => match message {
                Some(Ok(Message::Pong(_))) => {
                    deadline.as_mut().reset(Instant::now() + pong_wait);
                }
                Some(Ok(Message::Close(_))) | None => return Liveness::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Liveness::Failed(e.to_string()),
            },
        }
    }
}
