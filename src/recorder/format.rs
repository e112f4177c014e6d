//! Recording Line Format
//!
//! One JSON object per line: the frame exactly as received with a `"_time"`
//! member spliced in front of its first member. Cutting the splice out again
//! gives back the original bytes.
//!
//! ```text
//! {"typeName":"LapEvent","lap":3}
//! {"_time":"2020-02-01T10:00:00.5Z","typeName":"LapEvent","lap":3}
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::events::{DecodeError, DecodeResult};

/// Name of the ingestion timestamp member
pub const TIME_FIELD: &str = "_time";

const PREFIX: &str = "{\"_time\":\"";

/// A frame read back from a recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub time: DateTime<Utc>,
    pub payload: String,
}

/// Encode one frame as a recording line (without the newline)
pub fn encode_line(payload: &str, time: DateTime<Utc>) -> DecodeResult<String> {
    if payload.contains('\n') || payload.contains('\r') {
        return Err(DecodeError::Recording("frame spans multiple lines".to_string()));
    }
    let object: Map<String, Value> = serde_json::from_str(payload)?;
    if object.contains_key(TIME_FIELD) {
        return Err(DecodeError::Recording(format!("frame already has {}", TIME_FIELD)));
    }
    let Some(body) = payload.strip_prefix('{') else {
        return Err(DecodeError::Recording("frame does not start with '{'".to_string()));
    };

    let stamp = time.to_rfc3339_opts(SecondsFormat::AutoSi, true);
    let line = if object.is_empty() {
        format!("{}{}\"{}", PREFIX, stamp, body)
    } else {
        format!("{}{}\",{}", PREFIX, stamp, body)
    };
    Ok(line)
}

/// Decode a recording line back into its timestamp and original frame.
///
/// Lines whose `_time` member is not in front are accepted too; their frame
/// is re-serialized without it.
pub fn decode_line(line: &str) -> DecodeResult<RecordedFrame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(frame) = decode_spliced(line)? {
        return Ok(frame);
    }

    let mut object: Map<String, Value> = serde_json::from_str(line)?;
    let time = match object.remove(TIME_FIELD) {
        Some(Value::String(stamp)) => parse_time(&stamp)?,
        Some(other) => {
            return Err(DecodeError::Recording(format!("{} is not a string: {}", TIME_FIELD, other)))
        }
        None => return Err(DecodeError::MissingPayload(TIME_FIELD)),
    };
    Ok(RecordedFrame {
        time,
        payload: serde_json::to_string(&object)?,
    })
}

fn decode_spliced(line: &str) -> DecodeResult<Option<RecordedFrame>> {
    let Some(rest) = line.strip_prefix(PREFIX) else {
        return Ok(None);
    };
    let Some(end) = rest.find('"') else {
        return Ok(None);
    };
    let time = parse_time(&rest[..end])?;
    let tail = &rest[end + 1..];

    let payload = if let Some(members) = tail.strip_prefix(',') {
        format!("{{{}", members)
    } else if tail.starts_with('}') {
        format!("{{{}", tail)
    } else {
        return Ok(None);
    };
    Ok(Some(RecordedFrame { time, payload }))
}

fn parse_time(stamp: &str) -> DecodeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DecodeError::Recording(format!("invalid {} {:?}: {}", TIME_FIELD, stamp, e)))
}
