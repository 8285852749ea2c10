use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::{error::AppError, models::ride::Ride, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/rides/:domain", get(rides_by_domain))
}

/// Rides posted under an organization domain; 404 when there are none.
async fn rides_by_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Vec<Ride>>, AppError> {
    let rides = state.rides.rides_for_domain(&domain).await?;
    if rides.is_empty() {
        return Err(AppError::NotFound);
    }
    Ok(Json(rides))
}
