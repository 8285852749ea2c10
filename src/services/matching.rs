use serde::Deserialize;

use crate::models::{location::Coordinate, ride::Ride};

/// Optional narrowing applied when a passenger browses rides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RideFilter {
    pub destination: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Only rides starting within this distance of `(lat, lng)`.
    pub radius_m: Option<f64>,
}

impl RideFilter {
    pub fn near(&self) -> Option<Coordinate> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)).filter(Coordinate::is_valid),
            _ => None,
        }
    }
}

/// Rides a passenger could still join.
///
/// A single linear pass: the ride must be active with a free seat, not driven
/// by the passenger and not already carrying them. A destination filter
/// matches case-insensitively on the destination name. With a reference
/// point, results are ordered by distance to the ride's source, otherwise by
/// departure time.
pub fn match_rides(rides: Vec<Ride>, passenger_id: i64, filter: &RideFilter) -> Vec<Ride> {
    let destination = filter
        .destination
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_lowercase);
    let near = filter.near();

    let mut matched: Vec<(Option<f64>, Ride)> = rides
        .into_iter()
        .filter(|ride| ride.is_active() && ride.seats_available > 0)
        .filter(|ride| ride.driver_id != passenger_id && !ride.has_passenger(passenger_id))
        .filter(|ride| match &destination {
            Some(needle) => ride.destination_name.to_lowercase().contains(needle),
            None => true,
        })
        .map(|ride| (near.map(|point| point.distance_m(&ride.source)), ride))
        .filter(|(distance, _)| match (distance, filter.radius_m) {
            (Some(distance), Some(radius)) => *distance <= radius,
            _ => true,
        })
        .collect();

    matched.sort_by(|(da, a), (db, b)| match (da, db) {
        (Some(da), Some(db)) => da.total_cmp(db),
        _ => a.departure_at.cmp(&b.departure_at),
    });
    matched.into_iter().map(|(_, ride)| ride).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ride::{Passenger, RideStatus};
    use chrono::{Duration, Utc};

    fn ride(id: &str, driver_id: i64, destination: &str, source: Coordinate) -> Ride {
        Ride {
            id: id.into(),
            driver_id,
            driver_name: format!("driver {driver_id}"),
            domain: "iitb.ac.in".into(),
            source_name: "Campus".into(),
            source,
            destination_name: destination.into(),
            destination: Coordinate::new(19.0, 72.8),
            polyline: vec![],
            distance_m: None,
            duration_s: None,
            seats_total: 3,
            seats_available: 3,
            price: 50.0,
            departure_at: Utc::now() + Duration::minutes(driver_id),
            status: RideStatus::Active,
            passengers: vec![],
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn skips_own_full_completed_and_joined_rides() {
        let campus = Coordinate::new(19.13, 72.91);
        let mine = ride("mine", 7, "Airport", campus);
        let mut full = ride("full", 2, "Airport", campus);
        full.seats_available = 0;
        let mut done = ride("done", 3, "Airport", campus);
        done.status = RideStatus::Completed;
        let mut joined = ride("joined", 4, "Airport", campus);
        joined.passengers.push(Passenger {
            user_id: 7,
            name: "me".into(),
            request_id: "req".into(),
            pickup_name: None,
            pickup_lat: 19.13,
            pickup_lng: 72.91,
            joined_at: Utc::now(),
        });
        let open = ride("open", 5, "Airport", campus);

        let matched = match_rides(vec![mine, full, done, joined, open], 7, &RideFilter::default());
        let ids: Vec<_> = matched.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["open"]);
    }

    #[test]
    fn filters_by_destination_and_orders_by_distance() {
        let far = ride("far", 1, "Andheri Station", Coordinate::new(19.20, 72.97));
        let near = ride("near", 2, "andheri east", Coordinate::new(19.131, 72.911));
        let other = ride("other", 3, "Airport", Coordinate::new(19.13, 72.91));
        let filter = RideFilter {
            destination: Some("Andheri".into()),
            lat: Some(19.13),
            lng: Some(72.91),
            radius_m: None,
        };

        let matched = match_rides(vec![far, near, other], 9, &filter);
        let ids: Vec<_> = matched.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
    }

    #[test]
    fn radius_drops_distant_rides() {
        let far = ride("far", 1, "Airport", Coordinate::new(19.40, 73.20));
        let close = ride("close", 2, "Airport", Coordinate::new(19.131, 72.911));
        let filter = RideFilter {
            destination: None,
            lat: Some(19.13),
            lng: Some(72.91),
            radius_m: Some(2_000.0),
        };
        let matched = match_rides(vec![far, close], 9, &filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "close");
    }
}
