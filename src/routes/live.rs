use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::{
    auth::{AuthenticatedUser, CurrentUser},
    error::AppError,
    models::{
        location::{LocationEntry, LocationEvent, ParticipantKey, ParticipantRole},
        ride::Ride,
    },
    services::relay::{PositionReport, PublishOutcome},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/rides/:id/location",
            get(location_snapshot).post(publish_location),
        )
        .route(
            "/rides/:id/location/watch",
            put(start_watch).delete(stop_watch),
        )
        .route("/rides/:id/location/stream", get(location_stream))
}

/// Works out which slot of the ride's record belongs to the caller.
fn participant_key(ride: &Ride, user: &AuthenticatedUser) -> Result<ParticipantKey, AppError> {
    if ride.driver_id == user.id {
        Ok(ParticipantKey::new(ParticipantRole::Driver, user.uuid.clone()))
    } else if ride.has_passenger(user.id) {
        Ok(ParticipantKey::new(
            ParticipantRole::Passenger,
            user.uuid.clone(),
        ))
    } else {
        Err(AppError::Forbidden)
    }
}

async fn live_participant(
    state: &AppState,
    current: &CurrentUser,
    ride_id: &str,
) -> Result<(Ride, ParticipantKey), AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(ride_id).await?;
    let key = participant_key(&ride, user)?;
    if !ride.is_active() {
        return Err(AppError::Conflict("ride has ended".into()));
    }
    Ok((ride, key))
}

#[derive(Serialize)]
struct WatchStatus {
    ride_id: String,
    role: ParticipantRole,
    watching: bool,
}

async fn start_watch(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Json<WatchStatus>, AppError> {
    let (ride, key) = live_participant(&state, &current, &ride_id).await?;
    state.relay.activate(&ride.id, key.clone())?;
    Ok(Json(WatchStatus {
        ride_id: ride.id,
        role: key.role,
        watching: true,
    }))
}

async fn stop_watch(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(&ride_id).await?;
    let key = participant_key(&ride, user)?;
    state.relay.deactivate(&ride.id, &key);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum PublishResponse {
    Published { entry: LocationEntry },
    Notice { message: String },
}

async fn publish_location(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
    Json(report): Json<PositionReport>,
) -> Result<Json<PublishResponse>, AppError> {
    let (ride, key) = live_participant(&state, &current, &ride_id).await?;
    let response = match state.relay.publish(&ride.id, &key, report)? {
        PublishOutcome::Published(entry) => PublishResponse::Published { entry },
        PublishOutcome::Notice(message) => PublishResponse::Notice { message },
    };
    Ok(Json(response))
}

async fn location_snapshot(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Json<Vec<LocationEntry>>, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(&ride_id).await?;
    let key = participant_key(&ride, user)?;
    Ok(Json(state.relay.snapshot(&ride.id, key.role)))
}

async fn location_stream(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (ride, key) = live_participant(&state, &current, &ride_id).await?;
    // The stream owns the watch: disconnecting leaves the ride, and stopping
    // the watch ends the stream.
    let events = state
        .relay
        .join(&ride.id, key)?
        .into_stream()
        .filter_map(|event| async move { location_event(&event) })
        .map(Ok);
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn location_event(event: &LocationEvent) -> Option<Event> {
    let name = match event {
        LocationEvent::Moved(_) => "moved",
        LocationEvent::Left { .. } => "left",
    };
    Event::default().event(name).json_data(event).ok()
}
