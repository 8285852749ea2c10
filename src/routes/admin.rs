use std::{convert::Infallible, time::Duration};

use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::info;

use crate::{
    auth::CurrentUser,
    error::AppError,
    models::{
        alert::{AlertStatus, SosAlert},
        ride::RideStatus,
        user::{User, UserProfile, UserRole},
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(dashboard))
        .route("/api/alerts", get(alerts_list))
        .route("/api/alerts/stream", get(alerts_stream))
        .route("/api/alerts/:id/resolve", post(resolve_alert))
        .route("/api/users", get(users_list))
        .route("/api/users/:id/role", post(update_user_role))
        .route("/api/users/:id/verification", post(update_verification))
}

#[derive(Template)]
#[template(path = "admin/dashboard.html")]
struct AdminDashboardTemplate {
    user_count: i64,
    active_rides: i64,
    completed_rides: i64,
    live_rides: usize,
    alerts: Vec<AlertSummary>,
}

#[derive(Clone)]
struct AlertSummary {
    id: String,
    when: String,
    user_name: String,
    user_email: String,
    position: String,
    message: String,
    map_url: String,
}

impl AlertSummary {
    fn from_alert(alert: &SosAlert) -> Self {
        Self {
            id: alert.id.clone(),
            when: format_timestamp(alert.created_at),
            user_name: alert.user_name.clone(),
            user_email: alert.user_email.clone(),
            position: format!("{:.5}, {:.5}", alert.lat, alert.lng),
            message: alert.message.clone().unwrap_or_default(),
            map_url: format!(
                "https://www.openstreetmap.org/?mlat={}&mlon={}#map=17/{}/{}",
                alert.lat, alert.lng, alert.lat, alert.lng
            ),
        }
    }
}

async fn dashboard(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    current.require_admin()?;
    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await?;
    let active_rides = state.rides.count_rides(RideStatus::Active).await?;
    let completed_rides = state.rides.count_rides(RideStatus::Completed).await?;
    let alerts = state
        .alerts
        .list(Some(AlertStatus::Active))
        .await?
        .iter()
        .map(AlertSummary::from_alert)
        .collect();
    Ok(AskamaTemplateResponse::into_response(
        AdminDashboardTemplate {
            user_count,
            active_rides,
            completed_rides,
            live_rides: state.relay.live_rides(),
            alerts,
        },
    ))
}

#[derive(Deserialize)]
struct AlertQuery {
    status: Option<String>,
}

async fn alerts_list(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<SosAlert>>, AppError> {
    current.require_admin()?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AlertStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    Ok(Json(state.alerts.list(status).await?))
}

async fn alerts_stream(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    current.require_admin()?;
    let events = state
        .alerts
        .feed()
        .filter_map(|alert| async move {
            let name = match alert.status() {
                AlertStatus::Active => "raised",
                AlertStatus::Resolved => "resolved",
            };
            Event::default().event(name).json_data(&alert).ok()
        })
        .map(Ok);
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn resolve_alert(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(alert_id): Path<String>,
) -> Result<Json<SosAlert>, AppError> {
    let admin = current.require_admin()?;
    Ok(Json(state.alerts.resolve(&alert_id, admin.id).await?))
}

async fn users_list(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    current.require_admin()?;
    let users: Vec<User> = sqlx::query_as("SELECT * FROM users ORDER BY created_at DESC")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(users.iter().map(User::profile).collect()))
}

#[derive(Deserialize)]
struct RoleForm {
    role: String,
}

async fn update_user_role(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(user_id): Path<i64>,
    Json(form): Json<RoleForm>,
) -> Result<Json<UserProfile>, AppError> {
    let admin = current.require_admin()?;
    let role: UserRole = form.role.parse().map_err(AppError::BadRequest)?;
    let updated = sqlx::query("UPDATE users SET role = ?1 WHERE id = ?2")
        .bind(role.as_str())
        .bind(user_id)
        .execute(&state.db)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    info!(admin = admin.id, user_id, role = %role, "role changed");
    Ok(Json(crate::auth::load_user(&state, user_id).await?.profile()))
}

#[derive(Deserialize)]
struct VerificationForm {
    id_verified: Option<bool>,
    aadhar_verified: Option<bool>,
}

async fn update_verification(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(user_id): Path<i64>,
    Json(form): Json<VerificationForm>,
) -> Result<Json<UserProfile>, AppError> {
    let admin = current.require_admin()?;
    let mut user = crate::auth::load_user(&state, user_id).await?;
    if let Some(flag) = form.id_verified {
        user.id_verified = flag;
    }
    if let Some(flag) = form.aadhar_verified {
        user.aadhar_verified = flag;
    }
    sqlx::query("UPDATE users SET id_verified = ?1, aadhar_verified = ?2 WHERE id = ?3")
        .bind(user.id_verified)
        .bind(user.aadhar_verified)
        .bind(user.id)
        .execute(&state.db)
        .await?;
    info!(
        admin = admin.id,
        user_id,
        id_verified = user.id_verified,
        aadhar_verified = user.aadhar_verified,
        "verification flags updated"
    );
    Ok(Json(user.profile()))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%d.%m.%Y %H:%M")
        .to_string()
}
