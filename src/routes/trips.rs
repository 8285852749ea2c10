use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::warn;

use crate::{
    auth::CurrentUser,
    error::AppError,
    models::{
        location::Coordinate,
        request::{Decision, NewRideRequest, RideRequest},
        ride::{NewRide, Ride},
    },
    services::{
        matching::{match_rides, RideFilter},
        routing::{straight_route, PlannedRoute},
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rides", get(my_rides).post(create_ride))
        .route("/available-rides", get(available_rides))
        .route("/rides/:id", get(ride_detail))
        .route("/rides/:id/complete", post(complete_ride))
        .route("/rides/:id/requests", get(ride_requests).post(request_seat))
        .route("/requests", get(my_requests))
        .route("/requests/:id/accept", post(accept_request))
        .route("/requests/:id/reject", post(reject_request))
}

async fn my_rides(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<Ride>>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.rides.rides_for_driver(user.id).await?))
}

async fn create_ride(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<NewRide>,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let route = plan_route(&state, &form).await;
    let ride = state.rides.create_ride(user, form, route).await?;
    Ok((StatusCode::CREATED, Json(ride)))
}

async fn plan_route(state: &AppState, form: &NewRide) -> PlannedRoute {
    if let Some(polyline) = form.polyline.as_ref().filter(|line| line.len() >= 2) {
        return PlannedRoute {
            distance_m: path_length(polyline),
            polyline: polyline.clone(),
            duration_s: 0.0,
        };
    }
    // Out-of-range endpoints are rejected by the store; don't route them.
    let routable = form.source.is_valid() && form.destination.is_valid();
    if let Some(planner) = state.planner.as_ref().filter(|_| routable) {
        match planner.plan(form.source, form.destination).await {
            Ok(route) => return route,
            Err(err) => warn!(error = %err, "route planning failed, using straight line"),
        }
    }
    straight_route(form.source, form.destination)
}

fn path_length(points: &[Coordinate]) -> f64 {
    points
        .windows(2)
        .map(|pair| pair[0].distance_m(&pair[1]))
        .sum()
}

async fn available_rides(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(filter): Query<RideFilter>,
) -> Result<Json<Vec<Ride>>, AppError> {
    let user = current.require_user()?;
    let rides = state.rides.active_rides_for_domain(&user.domain).await?;
    Ok(Json(match_rides(rides, user.id, &filter)))
}

async fn ride_detail(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Json<Ride>, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(&ride_id).await?;
    if ride.domain != user.domain && ride.driver_id != user.id {
        return Err(AppError::NotFound);
    }
    Ok(Json(ride))
}

async fn complete_ride(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Json<Ride>, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.complete_ride(&ride_id, user.id).await?;
    state.relay.close_ride(&ride.id);
    Ok(Json(ride))
}

async fn ride_requests(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
) -> Result<Json<Vec<RideRequest>>, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(&ride_id).await?;
    if ride.driver_id != user.id {
        return Err(AppError::Forbidden);
    }
    Ok(Json(state.rides.requests_for_ride(&ride_id).await?))
}

async fn request_seat(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(ride_id): Path<String>,
    Json(form): Json<NewRideRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let ride = state.rides.require_ride(&ride_id).await?;
    if ride.domain != user.domain {
        return Err(AppError::NotFound);
    }
    let request = state.rides.create_request(&ride_id, user, form).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn my_requests(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<RideRequest>>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.rides.requests_by_passenger(user.id).await?))
}

#[derive(serde::Serialize)]
struct DecisionResponse {
    request: RideRequest,
    ride: Ride,
}

async fn accept_request(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(request_id): Path<String>,
) -> Result<Json<DecisionResponse>, AppError> {
    decide(state, current, request_id, Decision::Accept).await
}

async fn reject_request(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(request_id): Path<String>,
) -> Result<Json<DecisionResponse>, AppError> {
    decide(state, current, request_id, Decision::Reject).await
}

async fn decide(
    state: AppState,
    current: CurrentUser,
    request_id: String,
    decision: Decision,
) -> Result<Json<DecisionResponse>, AppError> {
    let user = current.require_user()?;
    let (request, ride) = state
        .rides
        .decide_request(&request_id, user.id, decision)
        .await?;
    Ok(Json(DecisionResponse { request, ride }))
}
