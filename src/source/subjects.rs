//! Broker subject scheme

use crate::events::HeatKey;

pub const COMPETITION_ACTIVATIONS: &str = "competition.activations";

pub fn competition_events(competition_id: &str) -> String {
    format!("competition.{}", competition_id)
}

pub fn distance_activations(competition_id: &str) -> String {
    format!("competition.{}.distances.activations", competition_id)
}

pub fn distance_events(competition_id: &str, distance_id: &str) -> String {
    format!("competition.{}.distances.{}", competition_id, distance_id)
}

pub fn heat_activations(competition_id: &str, distance_id: &str, group: u32) -> String {
    format!(
        "competition.{}.distances.{}.heats.activations.{}",
        competition_id, distance_id, group
    )
}

pub fn heat_events(competition_id: &str, distance_id: &str, heat: HeatKey) -> String {
    format!(
        "competition.{}.distances.{}.heats.{}.{}",
        competition_id, distance_id, heat.round, heat.number
    )
}
