//! Event Model
//!
//! Activation and raw events as they travel over the broker. Every decoded
//! event keeps the exact text it was decoded from, so the hub can re-publish
//! it without re-encoding.
//!
//! Activation subjects carry two kinds of messages for the same identity:
//! an activation (with the entity payload) and a deactivation (identity
//! only). Both decode into a [`Signal`].

mod entities;
mod error;

pub use entities::{Competition, Distance, HeatKey, PAIRED_LONG_TRACK_PREFIX};
pub use error::{DecodeError, DecodeResult};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::hash::Hash;

pub const COMPETITION_ACTIVATED: &str = "CompetitionActivatedEvent";
pub const COMPETITION_DEACTIVATED: &str = "CompetitionDeactivatedEvent";
pub const DISTANCE_ACTIVATED: &str = "DistanceActivatedEvent";
pub const DISTANCE_DEACTIVATED: &str = "DistanceDeactivatedEvent";
pub const HEAT_ACTIVATED: &str = "HeatActivatedEvent";
pub const HEAT_DEACTIVATED: &str = "HeatDeactivatedEvent";

/// An activation or deactivation read from an activation subject
#[derive(Debug, Clone)]
pub enum Signal<A: Activation> {
    Activated(A),
    Deactivated(A::Key),
}

impl<A: Activation> Signal<A> {
    /// Identity the signal refers to
    pub fn key(&self) -> A::Key {
        match self {
            Signal::Activated(activation) => activation.key(),
            Signal::Deactivated(key) => key.clone(),
        }
    }
}

/// Common shape of the three activation levels
pub trait Activation: Clone + Send + Sync + 'static {
    /// Identity of the entity within its parent
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    const ACTIVATED: &'static str;
    const DEACTIVATED: &'static str;

    fn key(&self) -> Self::Key;

    /// Broker timestamp of the activation
    fn time(&self) -> DateTime<Utc>;

    /// The activation exactly as received
    fn raw(&self) -> &str;

    /// Decode a message from an activation subject
    fn decode(data: &[u8], time: DateTime<Utc>) -> DecodeResult<Signal<Self>>;
}

#[derive(Deserialize)]
struct Tagged<W> {
    #[serde(rename = "typeName", default)]
    type_name: String,
    #[serde(flatten)]
    body: W,
}

/// Parse `data` and check its type tag against the activation/deactivation
/// pair. Returns whether it is an activation, the body and the text.
fn decode_tagged<W: DeserializeOwned>(
    data: &[u8],
    activated: &str,
    deactivated: &str,
) -> DecodeResult<(bool, W, String)> {
    let text = String::from_utf8(data.to_vec())?;
    let tagged: Tagged<W> = serde_json::from_str(&text)?;
    let is_activation = if tagged.type_name == activated {
        true
    } else if tagged.type_name == deactivated {
        false
    } else {
        return Err(DecodeError::TypeMismatch {
            expected: format!("{} or {}", activated, deactivated),
            found: tagged.type_name,
        });
    };
    Ok((is_activation, tagged.body, text))
}

/// A competition activation
#[derive(Debug, Clone)]
pub struct CompetitionActivated {
    pub competition_id: String,
    pub competition: Competition,
    pub time: DateTime<Utc>,
    pub raw: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompetitionBody {
    competition_id: String,
    #[serde(default)]
    competition: Option<Competition>,
}

impl Activation for CompetitionActivated {
    type Key = String;

    const ACTIVATED: &'static str = COMPETITION_ACTIVATED;
    const DEACTIVATED: &'static str = COMPETITION_DEACTIVATED;

    fn key(&self) -> String {
        self.competition_id.clone()
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn raw(&self) -> &str {
        &self.raw
    }

    fn decode(data: &[u8], time: DateTime<Utc>) -> DecodeResult<Signal<Self>> {
        let (is_activation, body, raw) =
            decode_tagged::<CompetitionBody>(data, Self::ACTIVATED, Self::DEACTIVATED)?;
        if !is_activation {
            return Ok(Signal::Deactivated(body.competition_id));
        }
        let competition = body
            .competition
            .ok_or(DecodeError::MissingPayload("competition"))?;
        Ok(Signal::Activated(Self {
            competition_id: body.competition_id,
            competition,
            time,
            raw,
        }))
    }
}

/// A distance activation
#[derive(Debug, Clone)]
pub struct DistanceActivated {
    pub competition_id: String,
    pub distance_id: String,
    pub distance: Distance,
    pub time: DateTime<Utc>,
    pub raw: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistanceBody {
    competition_id: String,
    distance_id: String,
    #[serde(default)]
    distance: Option<Distance>,
}

impl Activation for DistanceActivated {
    type Key = String;

    const ACTIVATED: &'static str = DISTANCE_ACTIVATED;
    const DEACTIVATED: &'static str = DISTANCE_DEACTIVATED;

    fn key(&self) -> String {
        self.distance_id.clone()
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn raw(&self) -> &str {
        &self.raw
    }

    fn decode(data: &[u8], time: DateTime<Utc>) -> DecodeResult<Signal<Self>> {
        let (is_activation, body, raw) =
            decode_tagged::<DistanceBody>(data, Self::ACTIVATED, Self::DEACTIVATED)?;
        if !is_activation {
            return Ok(Signal::Deactivated(body.distance_id));
        }
        let distance = body.distance.ok_or(DecodeError::MissingPayload("distance"))?;
        Ok(Signal::Activated(Self {
            competition_id: body.competition_id,
            distance_id: body.distance_id,
            distance,
            time,
            raw,
        }))
    }
}

/// A heat activation
#[derive(Debug, Clone)]
pub struct HeatActivated {
    pub competition_id: String,
    pub distance_id: String,
    pub heat: HeatKey,
    pub time: DateTime<Utc>,
    pub raw: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeatBody {
    competition_id: String,
    distance_id: String,
    heat: HeatKey,
}

impl Activation for HeatActivated {
    type Key = HeatKey;

    const ACTIVATED: &'static str = HEAT_ACTIVATED;
    const DEACTIVATED: &'static str = HEAT_DEACTIVATED;

    fn key(&self) -> HeatKey {
        self.heat
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn raw(&self) -> &str {
        &self.raw
    }

    fn decode(data: &[u8], time: DateTime<Utc>) -> DecodeResult<Signal<Self>> {
        let (is_activation, body, raw) =
            decode_tagged::<HeatBody>(data, Self::ACTIVATED, Self::DEACTIVATED)?;
        if !is_activation {
            return Ok(Signal::Deactivated(body.heat));
        }
        Ok(Signal::Activated(Self {
            competition_id: body.competition_id,
            distance_id: body.distance_id,
            heat: body.heat,
            time,
            raw,
        }))
    }
}

/// A raw event, opaque apart from its type tag
#[derive(Debug, Clone, PartialEq)]
pub struct Raw {
    pub type_name: String,
    pub text: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "typeName", default)]
    type_name: String,
}

impl Raw {
    /// Read the type tag of a JSON event, keeping its text verbatim
    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let text = String::from_utf8(data.to_vec())?;
        let envelope: Envelope = serde_json::from_str(&text)?;
        Ok(Self {
            type_name: envelope.type_name,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_competition_activation_keeps_raw_text() {
        let json = r#"{"typeName":"CompetitionActivatedEvent","competitionId":"A","competition":{"id":"A","name":"NK Allround"}}"#;
        let now = Utc::now();
        match CompetitionActivated::decode(json.as_bytes(), now).unwrap() {
            Signal::Activated(a) => {
                assert_eq!(a.competition_id, "A");
                assert_eq!(a.competition.name, "NK Allround");
                assert_eq!(a.raw, json);
                assert_eq!(a.time, now);
            }
            Signal::Deactivated(_) => panic!("Expected activation"),
        }
    }

    #[test]
    fn test_decode_deactivation_carries_identity_only() {
        let json = r#"{"typeName":"DistanceDeactivatedEvent","competitionId":"A","distanceId":"d2"}"#;
        let signal = DistanceActivated::decode(json.as_bytes(), Utc::now()).unwrap();
        assert!(matches!(signal, Signal::Deactivated(ref id) if id == "d2"));
        assert_eq!(signal.key(), "d2");
    }

    #[test]
    fn test_decode_rejects_wrong_type_tag() {
        let json = r#"{"typeName":"HeatActivatedEvent","competitionId":"A","competition":{"id":"A"}}"#;
        let err = CompetitionActivated::decode(json.as_bytes(), Utc::now()).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { ref found, .. } if found == "HeatActivatedEvent"));
    }

    #[test]
    fn test_decode_activation_without_payload_fails() {
        let json = r#"{"typeName":"DistanceActivatedEvent","competitionId":"A","distanceId":"d1"}"#;
        let err = DistanceActivated::decode(json.as_bytes(), Utc::now()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload("distance")));
    }

    #[test]
    fn test_decode_heat_identity() {
        let json = r#"{"typeName":"HeatActivatedEvent","competitionId":"A","distanceId":"d1","heat":{"round":2,"number":7}}"#;
        let signal = HeatActivated::decode(json.as_bytes(), Utc::now()).unwrap();
        assert_eq!(signal.key(), HeatKey { round: 2, number: 7 });
    }

    #[test]
    fn test_raw_reads_type_tag() {
        let raw = Raw::decode(br#"{"typeName":"LapTimeEvent","time":"34.12"}"#).unwrap();
        assert_eq!(raw.type_name, "LapTimeEvent");
        assert!(raw.text.contains("34.12"));
        assert!(Raw::decode(b"not json").is_err());
    }
}
