use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

use crate::models::location::Coordinate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Active,
    Completed,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Active => "ACTIVE",
            RideStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ACTIVE" => Ok(RideStatus::Active),
            "COMPLETED" => Ok(RideStatus::Completed),
            other => Err(format!("unknown ride status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RideRow {
    pub id: String,
    pub driver_id: i64,
    pub driver_name: String,
    pub domain: String,
    pub source_name: String,
    pub source_lat: f64,
    pub source_lng: f64,
    pub destination_name: String,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub polyline: String,
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
    pub seats_total: i64,
    pub seats_available: i64,
    pub price: f64,
    pub departure_at: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Passenger {
    pub user_id: i64,
    pub name: String,
    pub request_id: String,
    pub pickup_name: Option<String>,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub joined_at: DateTime<Utc>,
}

/// A ride document with its embedded passenger list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: String,
    pub driver_id: i64,
    pub driver_name: String,
    pub domain: String,
    pub source_name: String,
    pub source: Coordinate,
    pub destination_name: String,
    pub destination: Coordinate,
    pub polyline: Vec<Coordinate>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
    pub seats_total: i64,
    pub seats_available: i64,
    pub price: f64,
    pub departure_at: DateTime<Utc>,
    pub status: RideStatus,
    pub passengers: Vec<Passenger>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Ride {
    pub fn from_row(row: RideRow, passengers: Vec<Passenger>) -> Result<Self, String> {
        let polyline: Vec<Coordinate> =
            serde_json::from_str(&row.polyline).map_err(|err| err.to_string())?;
        Ok(Self {
            id: row.id,
            driver_id: row.driver_id,
            driver_name: row.driver_name,
            domain: row.domain,
            source_name: row.source_name,
            source: Coordinate::new(row.source_lat, row.source_lng),
            destination_name: row.destination_name,
            destination: Coordinate::new(row.destination_lat, row.destination_lng),
            polyline,
            distance_m: row.distance_m,
            duration_s: row.duration_s,
            seats_total: row.seats_total,
            seats_available: row.seats_available,
            price: row.price,
            departure_at: row.departure_at,
            status: row.status.parse()?,
            passengers,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == RideStatus::Active
    }

    pub fn has_passenger(&self, user_id: i64) -> bool {
        self.passengers.iter().any(|p| p.user_id == user_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRide {
    pub source_name: String,
    pub source: Coordinate,
    pub destination_name: String,
    pub destination: Coordinate,
    #[serde(default)]
    pub polyline: Option<Vec<Coordinate>>,
    pub seats: i64,
    pub price: f64,
    pub departure_at: DateTime<Utc>,
}

pub const MAX_SEATS: i64 = 8;

impl NewRide {
    pub fn validate(&self) -> Result<(), String> {
        if self.source_name.trim().is_empty() || self.destination_name.trim().is_empty() {
            return Err("source and destination names are required".into());
        }
        if !self.source.is_valid() || !self.destination.is_valid() {
            return Err("source or destination coordinates are out of range".into());
        }
        if !(1..=MAX_SEATS).contains(&self.seats) {
            return Err(format!("seats must be between 1 and {MAX_SEATS}"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err("price must be a non-negative number".into());
        }
        if let Some(polyline) = &self.polyline {
            if polyline.iter().any(|point| !point.is_valid()) {
                return Err("polyline contains invalid coordinates".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewRide {
        NewRide {
            source_name: "Main Gate".into(),
            source: Coordinate::new(19.13, 72.91),
            destination_name: "Andheri Station".into(),
            destination: Coordinate::new(19.12, 72.85),
            polyline: None,
            seats: 3,
            price: 80.0,
            departure_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_reasonable_ride() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_bad_seat_counts_and_prices() {
        let mut ride = sample();
        ride.seats = 0;
        assert!(ride.validate().is_err());
        ride.seats = MAX_SEATS + 1;
        assert!(ride.validate().is_err());
        ride.seats = 2;
        ride.price = -1.0;
        assert!(ride.validate().is_err());
    }
}
