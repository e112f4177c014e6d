//! Event Recorder
//!
//! Records the frames pushed by a hub endpoint to a line-oriented file and
//! serves such a file back to websocket clients with the original pacing.

pub mod format;
pub mod record;
pub mod replay;

pub use format::{decode_line, encode_line, RecordedFrame, TIME_FIELD};
pub use record::{record, RecordStats};
pub use replay::{replay_delay, ReplayState};

use thiserror::Error;

use crate::events::DecodeError;

/// Errors of the recorder and replay server
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid recording line {line}: {error}")]
    Line { line: usize, error: DecodeError },

    #[error("Invalid frame: {0}")]
    Frame(#[from] DecodeError),
}

/// Result type alias for recorder operations
pub type RecorderResult<T> = Result<T, RecorderError>;
