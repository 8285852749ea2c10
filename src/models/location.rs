use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in meters.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Driver,
    Passenger,
}

impl ParticipantRole {
    /// The scope this role listens to.
    pub fn sibling(&self) -> ParticipantRole {
        match self {
            ParticipantRole::Driver => ParticipantRole::Passenger,
            ParticipantRole::Passenger => ParticipantRole::Driver,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Driver => "driver",
            ParticipantRole::Passenger => "passenger",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one slot inside a ride's location record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantKey {
    pub role: ParticipantRole,
    pub participant_id: String,
}

impl ParticipantKey {
    pub fn new(role: ParticipantRole, participant_id: impl Into<String>) -> Self {
        Self {
            role,
            participant_id: participant_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub ride_id: String,
    #[serde(flatten)]
    pub key: ParticipantKey,
    pub position: Coordinate,
    pub accuracy_m: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationEvent {
    Moved(LocationEntry),
    Left {
        ride_id: String,
        #[serde(flatten)]
        key: ParticipantKey,
    },
}

impl LocationEvent {
    pub fn key(&self) -> &ParticipantKey {
        match self {
            LocationEvent::Moved(entry) => &entry.key,
            LocationEvent::Left { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_between_known_points() {
        let mumbai = Coordinate::new(19.0760, 72.8777);
        let pune = Coordinate::new(18.5204, 73.8567);
        let km = mumbai.distance_m(&pune) / 1000.0;
        assert!((km - 120.0).abs() < 5.0, "got {km}");
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinate::new(12.9, 77.6).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn roles_listen_to_each_other() {
        assert_eq!(ParticipantRole::Driver.sibling(), ParticipantRole::Passenger);
        assert_eq!(ParticipantRole::Passenger.sibling(), ParticipantRole::Driver);
    }
}
