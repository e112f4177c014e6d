//! Event decode errors

use thiserror::Error;

/// Errors raised while decoding a broker message or a recording line
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not valid JSON for the expected shape
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is not UTF-8
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The type tag does not match any tag expected on this subject
    #[error("Invalid type name {found:?}, expected {expected}")]
    TypeMismatch { expected: String, found: String },

    /// An activation arrived without its entity payload
    #[error("Missing {0} payload")]
    MissingPayload(&'static str),

    /// A recording line does not start with the ingestion timestamp
    #[error("Invalid recording line: {0}")]
    Recording(String),
}

/// Result type alias for decoding
pub type DecodeResult<T> = Result<T, DecodeError>;
