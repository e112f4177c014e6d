//! Entity Payloads
//!
//! The decoded payloads carried by activation events. Fields the hub does
//! not interpret are kept so a payload survives a decode/encode cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discipline prefix of the paired long-track family. Distances in this
/// family can run two heats of the same round at once.
pub const PAIRED_LONG_TRACK_PREFIX: &str = "SpeedSkating.LongTrack.PairsDistance.";

/// A competition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Attributes passed through untouched
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A competition distance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub discipline: String,
    /// Zero means single heat
    #[serde(default)]
    pub start_mode: i64,
}

impl Distance {
    /// Whether the distance belongs to the paired long-track family
    pub fn is_paired_long_track(&self) -> bool {
        self.discipline.starts_with(PAIRED_LONG_TRACK_PREFIX)
    }

    /// Heat-activation groups to follow for this distance.
    ///
    /// Group 0 is always followed. Group 1 is added for paired long-track
    /// distances whose start mode is not single heat.
    pub fn heat_groups(&self) -> Vec<u32> {
        let mut groups = vec![0];
        if self.is_paired_long_track() && self.start_mode != 0 {
            groups.push(1);
        }
        groups
    }
}

/// Identity of a heat within a distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeatKey {
    pub round: i64,
    pub number: i64,
}

impl std::fmt::Display for HeatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.round, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(discipline: &str, start_mode: i64) -> Distance {
        Distance {
            id: "d1".to_string(),
            name: "500m".to_string(),
            discipline: discipline.to_string(),
            start_mode,
        }
    }

    #[test]
    fn test_paired_distance_with_start_mode_follows_both_groups() {
        let d = distance("SpeedSkating.LongTrack.PairsDistance.500", 1);
        assert_eq!(d.heat_groups(), vec![0, 1]);
    }

    #[test]
    fn test_single_heat_paired_distance_follows_group_zero() {
        let d = distance("SpeedSkating.LongTrack.PairsDistance.500", 0);
        assert_eq!(d.heat_groups(), vec![0]);
    }

    #[test]
    fn test_other_disciplines_follow_group_zero() {
        let d = distance("SpeedSkating.ShortTrack.Distance.500", 2);
        assert_eq!(d.heat_groups(), vec![0]);
        assert!(!d.is_paired_long_track());
    }

    #[test]
    fn test_competition_keeps_unknown_attributes() {
        let json = r#"{"id":"c1","name":"World Cup","venue":"Thialf","days":3}"#;
        let competition: Competition = serde_json::from_str(json).unwrap();
        assert_eq!(competition.name, "World Cup");
        assert_eq!(competition.attributes["venue"], "Thialf");
        assert_eq!(competition.attributes["days"], 3);
    }

    #[test]
    fn test_distance_start_mode_is_camel_case() {
        let json = r#"{"id":"d1","name":"1000m","discipline":"x","startMode":1}"#;
        let d: Distance = serde_json::from_str(json).unwrap();
        assert_eq!(d.start_mode, 1);
    }
}
