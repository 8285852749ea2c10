use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    db::DbPool,
    error::AppError,
    models::{
        request::{Decision, NewRideRequest, RequestStatus, RideRequest},
        ride::{NewRide, Passenger, Ride, RideRow, RideStatus},
    },
    services::routing::PlannedRoute,
};

const RIDE_SELECT: &str = r#"
SELECT r.id, r.driver_id, u.name AS driver_name, r.domain,
       r.source_name, r.source_lat, r.source_lng,
       r.destination_name, r.destination_lat, r.destination_lng,
       r.polyline, r.distance_m, r.duration_s,
       r.seats_total, r.seats_available, r.price, r.departure_at,
       r.status, r.created_at, r.completed_at
FROM rides r JOIN users u ON u.id = r.driver_id
"#;

const DUPLICATE_PENDING: &str = "a request for this ride is already pending";

const REQUEST_SELECT: &str = r#"
SELECT q.id, q.ride_id, q.passenger_id, u.name AS passenger_name,
       q.pickup_name, q.pickup_lat, q.pickup_lng, q.status, q.created_at, q.resolved_at
FROM ride_requests q JOIN users u ON u.id = q.passenger_id
"#;

/// Ride documents, seat requests and the embedded passenger lists.
#[derive(Clone)]
pub struct RideStore {
    db: DbPool,
}

impl RideStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn create_ride(
        &self,
        driver: &AuthenticatedUser,
        ride: NewRide,
        route: PlannedRoute,
    ) -> Result<Ride, AppError> {
        ride.validate().map_err(AppError::BadRequest)?;
        let id = Uuid::new_v4().to_string();
        let polyline =
            serde_json::to_string(&route.polyline).map_err(|err| AppError::Other(err.into()))?;
        sqlx::query(
            r#"INSERT INTO rides (id, driver_id, domain, source_name, source_lat, source_lng,
                destination_name, destination_lat, destination_lng, polyline, distance_m, duration_s,
                seats_total, seats_available, price, departure_at, status, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?14, ?15, ?16, ?17)"#,
        )
        .bind(&id)
        .bind(driver.id)
        .bind(&driver.domain)
        .bind(ride.source_name.trim())
        .bind(ride.source.lat)
        .bind(ride.source.lng)
        .bind(ride.destination_name.trim())
        .bind(ride.destination.lat)
        .bind(ride.destination.lng)
        .bind(polyline)
        .bind(route.distance_m)
        .bind(route.duration_s)
        .bind(ride.seats)
        .bind(ride.price)
        .bind(ride.departure_at)
        .bind(RideStatus::Active.as_str())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        info!(ride_id = %id, driver = driver.id, domain = %driver.domain, seats = ride.seats, "ride created");
        self.get_ride(&id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_ride(&self, ride_id: &str) -> Result<Option<Ride>, AppError> {
        let row: Option<RideRow> = sqlx::query_as(&format!("{RIDE_SELECT} WHERE r.id = ?1"))
            .bind(ride_id)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn require_ride(&self, ride_id: &str) -> Result<Ride, AppError> {
        self.get_ride(ride_id).await?.ok_or(AppError::NotFound)
    }

    /// Every ride whose organization domain equals `domain`, newest first.
    pub async fn rides_for_domain(&self, domain: &str) -> Result<Vec<Ride>, AppError> {
        let rows: Vec<RideRow> = sqlx::query_as(&format!(
            "{RIDE_SELECT} WHERE r.domain = ?1 ORDER BY r.created_at DESC"
        ))
        .bind(domain.trim().to_lowercase())
        .fetch_all(&self.db)
        .await?;
        self.hydrate_all(rows).await
    }

    pub async fn active_rides_for_domain(&self, domain: &str) -> Result<Vec<Ride>, AppError> {
        let rows: Vec<RideRow> = sqlx::query_as(&format!(
            "{RIDE_SELECT} WHERE r.domain = ?1 AND r.status = ?2 ORDER BY r.departure_at"
        ))
        .bind(domain)
        .bind(RideStatus::Active.as_str())
        .fetch_all(&self.db)
        .await?;
        self.hydrate_all(rows).await
    }

    pub async fn rides_for_driver(&self, driver_id: i64) -> Result<Vec<Ride>, AppError> {
        let rows: Vec<RideRow> = sqlx::query_as(&format!(
            "{RIDE_SELECT} WHERE r.driver_id = ?1 ORDER BY r.departure_at DESC"
        ))
        .bind(driver_id)
        .fetch_all(&self.db)
        .await?;
        self.hydrate_all(rows).await
    }

    pub async fn count_rides(&self, status: RideStatus) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM rides WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    /// `ACTIVE` → `COMPLETED`. Only the driver may end the ride.
    pub async fn complete_ride(&self, ride_id: &str, driver_id: i64) -> Result<Ride, AppError> {
        let ride = self.require_ride(ride_id).await?;
        if ride.driver_id != driver_id {
            return Err(AppError::Forbidden);
        }
        let result = sqlx::query(
            "UPDATE rides SET status = ?1, completed_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(RideStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(ride_id)
        .bind(RideStatus::Active.as_str())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict("ride is already completed".into()));
        }
        info!(ride_id, driver = driver_id, "ride completed");
        self.require_ride(ride_id).await
    }

    pub async fn create_request(
        &self,
        ride_id: &str,
        passenger: &AuthenticatedUser,
        request: NewRideRequest,
    ) -> Result<RideRequest, AppError> {
        if !request.pickup.is_valid() {
            return Err(AppError::BadRequest("pickup coordinates are out of range".into()));
        }
        let ride = self.require_ride(ride_id).await?;
        if !ride.is_active() {
            return Err(AppError::Conflict("ride is no longer active".into()));
        }
        if ride.driver_id == passenger.id {
            return Err(AppError::BadRequest("drivers cannot request their own ride".into()));
        }
        if ride.has_passenger(passenger.id) {
            return Err(AppError::Conflict("already a passenger on this ride".into()));
        }
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ride_requests WHERE ride_id = ?1 AND passenger_id = ?2 AND status = ?3",
        )
        .bind(ride_id)
        .bind(passenger.id)
        .bind(RequestStatus::Pending.as_str())
        .fetch_one(&self.db)
        .await?;
        if pending > 0 {
            return Err(AppError::Conflict(DUPLICATE_PENDING.into()));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO ride_requests (id, ride_id, passenger_id, pickup_name, pickup_lat, pickup_lng, status, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )
        .bind(&id)
        .bind(ride_id)
        .bind(passenger.id)
        .bind(normalize_optional(request.pickup_name))
        .bind(request.pickup.lat)
        .bind(request.pickup.lng)
        .bind(RequestStatus::Pending.as_str())
        .bind(Utc::now())
        .execute(&self.db)
        .await
        .map_err(|err| AppError::unique_as_conflict(err, DUPLICATE_PENDING))?;

        info!(request_id = %id, ride_id, passenger = passenger.id, "seat requested");
        self.get_request(&id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Option<RideRequest>, AppError> {
        let request = sqlx::query_as(&format!("{REQUEST_SELECT} WHERE q.id = ?1"))
            .bind(request_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(request)
    }

    pub async fn requests_for_ride(&self, ride_id: &str) -> Result<Vec<RideRequest>, AppError> {
        let requests = sqlx::query_as(&format!(
            "{REQUEST_SELECT} WHERE q.ride_id = ?1 ORDER BY q.created_at"
        ))
        .bind(ride_id)
        .fetch_all(&self.db)
        .await?;
        Ok(requests)
    }

    pub async fn requests_by_passenger(
        &self,
        passenger_id: i64,
    ) -> Result<Vec<RideRequest>, AppError> {
        let requests = sqlx::query_as(&format!(
            "{REQUEST_SELECT} WHERE q.passenger_id = ?1 ORDER BY q.created_at DESC"
        ))
        .bind(passenger_id)
        .fetch_all(&self.db)
        .await?;
        Ok(requests)
    }

    /// Resolves a pending request. Accepting takes one seat and appends the
    /// passenger inside a single transaction; rejecting touches only the request.
    pub async fn decide_request(
        &self,
        request_id: &str,
        driver_id: i64,
        decision: Decision,
    ) -> Result<(RideRequest, Ride), AppError> {
        let mut tx = self.db.begin().await?;

        let request: RideRequest = sqlx::query_as(&format!("{REQUEST_SELECT} WHERE q.id = ?1"))
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;
        let (ride_driver, ride_status): (i64, String) =
            sqlx::query_as("SELECT driver_id, status FROM rides WHERE id = ?1")
                .bind(&request.ride_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound)?;
        if ride_driver != driver_id {
            return Err(AppError::Forbidden);
        }
        if request.status() != RequestStatus::Pending {
            return Err(AppError::Conflict(format!(
                "request is already {}",
                request.status()
            )));
        }

        if decision == Decision::Accept {
            if ride_status != RideStatus::Active.as_str() {
                return Err(AppError::Conflict("ride is no longer active".into()));
            }
            take_seat(&mut tx, &request).await?;
        }

        let resolved = sqlx::query(
            "UPDATE ride_requests SET status = ?1, resolved_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(decision.resulting_status().as_str())
        .bind(Utc::now())
        .bind(request_id)
        .bind(RequestStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        if resolved.rows_affected() == 0 {
            return Err(AppError::Conflict("request was resolved concurrently".into()));
        }
        tx.commit().await?;

        info!(
            request_id,
            ride_id = %request.ride_id,
            passenger = request.passenger_id,
            status = %decision.resulting_status(),
            "seat request resolved"
        );
        let request = self.get_request(request_id).await?.ok_or(AppError::NotFound)?;
        let ride = self.require_ride(&request.ride_id).await?;
        Ok((request, ride))
    }

    async fn hydrate(&self, row: RideRow) -> Result<Ride, AppError> {
        let passengers: Vec<Passenger> = sqlx::query_as(
            r#"SELECT p.user_id, u.name, p.request_id, p.pickup_name, p.pickup_lat, p.pickup_lng, p.joined_at
               FROM ride_passengers p JOIN users u ON u.id = p.user_id
               WHERE p.ride_id = ?1 ORDER BY p.joined_at"#,
        )
        .bind(&row.id)
        .fetch_all(&self.db)
        .await?;
        Ride::from_row(row, passengers)
            .map_err(|err| AppError::Other(anyhow::anyhow!("corrupt ride document: {err}")))
    }

    async fn hydrate_all(&self, rows: Vec<RideRow>) -> Result<Vec<Ride>, AppError> {
        let mut rides = Vec::with_capacity(rows.len());
        for row in rows {
            rides.push(self.hydrate(row).await?);
        }
        Ok(rides)
    }
}

async fn take_seat(tx: &mut Transaction<'_, Sqlite>, request: &RideRequest) -> Result<(), AppError> {
    let seat = sqlx::query(
        "UPDATE rides SET seats_available = seats_available - 1 WHERE id = ?1 AND status = ?2 AND seats_available > 0",
    )
    .bind(&request.ride_id)
    .bind(RideStatus::Active.as_str())
    .execute(&mut **tx)
    .await?;
    if seat.rows_affected() == 0 {
        return Err(AppError::Conflict("no seats left on this ride".into()));
    }

    sqlx::query(
        r#"INSERT INTO ride_passengers (ride_id, user_id, request_id, pickup_name, pickup_lat, pickup_lng, joined_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
    )
    .bind(&request.ride_id)
    .bind(request.passenger_id)
    .bind(&request.id)
    .bind(&request.pickup_name)
    .bind(request.pickup_lat)
    .bind(request.pickup_lng)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|err| AppError::unique_as_conflict(err, "already a passenger on this ride"))?;
    Ok(())
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
