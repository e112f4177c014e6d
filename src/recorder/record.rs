//! Record
//!
//! Connects to a hub endpoint and appends every text frame to the recording
//! file, stamped with the time it arrived.

use chrono::Utc;
use futures_util::StreamExt;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::format::encode_line;
use super::RecorderResult;
use crate::events::Raw;

/// Summary of a recording session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub frames: usize,
    pub skipped: usize,
}

/// Record frames from `url` into `path` until the hub closes the
/// connection or `token` is cancelled.
pub async fn record(url: &str, path: &Path, token: &CancellationToken) -> RecorderResult<RecordStats> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await?;
    tracing::info!(url = %url, file = ?path, "Recording");

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    let mut stats = RecordStats::default();

    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = socket.next() => match message {
                Some(message) => message?,
                None => break,
            },
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                tracing::info!(reason = ?frame, "Hub closed connection");
                break;
            }
            // Pongs are answered by the socket itself.
            _ => continue,
        };

        let now = Utc::now();
        let line = match Raw::decode(text.as_bytes()).and_then(|raw| Ok((raw, encode_line(&text, now)?))) {
            Ok((raw, line)) => {
                tracing::info!(time = %now, type_name = %raw.type_name, "Wrote frame");
                line
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping frame");
                stats.skipped += 1;
                continue;
            }
        };
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        stats.frames += 1;
    }

    file.flush().await?;
    let _ = socket.close(None).await;
    tracing::info!(frames = stats.frames, skipped = stats.skipped, "Recording stopped");
    Ok(stats)
}
