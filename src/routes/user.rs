use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    auth::{self, CurrentUser},
    error::AppError,
    models::user::UserProfile,
    services::{
        alerts::NewSosAlert,
        storage::{ImageKind, ImageUpload},
        vision::{fallback_tip, VerificationOutcome},
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(profile))
        .route("/profile", put(update_profile))
        .route("/profile/image", put(update_profile_image))
        .route("/verify-id", post(verify_id))
        .route("/tip", get(tip))
        .route("/sos", post(raise_sos))
}

async fn profile(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<UserProfile>, AppError> {
    let user = current.require_user()?;
    Ok(Json(auth::load_user(&state, user.id).await?.profile()))
}

#[derive(Deserialize)]
struct ProfileForm {
    name: Option<String>,
    phone: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<ProfileForm>,
) -> Result<Json<UserProfile>, AppError> {
    let user = current.require_user()?;
    let mut stored = auth::load_user(&state, user.id).await?;
    if let Some(name) = form.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("name cannot be empty".into()));
        }
        if name != stored.name {
            // A new name invalidates a check made against the old one.
            stored.id_verified = false;
        }
        stored.name = name.to_string();
    }
    if let Some(phone) = form.phone {
        let phone = phone.trim();
        stored.phone = (!phone.is_empty()).then(|| phone.to_string());
    }
    sqlx::query("UPDATE users SET name = ?1, phone = ?2, id_verified = ?3 WHERE id = ?4")
        .bind(&stored.name)
        .bind(&stored.phone)
        .bind(stored.id_verified)
        .bind(stored.id)
        .execute(&state.db)
        .await?;
    Ok(Json(stored.profile()))
}

#[derive(Deserialize)]
struct ImageForm {
    image: String,
}

async fn update_profile_image(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<ImageForm>,
) -> Result<Json<UserProfile>, AppError> {
    let user = current.require_user()?;
    let image = ImageUpload::from_base64(&form.image)?;
    let reference = state
        .storage
        .save_user_image(&user.uuid, ImageKind::Profile, &image)
        .await?;
    sqlx::query("UPDATE users SET profile_image = ?1 WHERE id = ?2")
        .bind(&reference)
        .bind(user.id)
        .execute(&state.db)
        .await?;
    Ok(Json(auth::load_user(&state, user.id).await?.profile()))
}

#[derive(Deserialize)]
struct VerifyForm {
    /// Omit to re-check the card submitted earlier.
    #[serde(default)]
    image: Option<String>,
}

async fn verify_id(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<VerifyForm>,
) -> Result<Json<VerificationOutcome>, AppError> {
    let user = current.require_user()?;
    let stored = auth::load_user(&state, user.id).await?;
    let image = match form.image.as_deref() {
        Some(raw) => ImageUpload::from_base64(raw)?,
        None => {
            let reference = stored
                .id_card_image
                .as_deref()
                .ok_or_else(|| AppError::BadRequest("no ID card on file".into()))?;
            state.storage.load_image(reference).await?
        }
    };
    Ok(Json(auth::verify_id_card(&state, &stored, &image).await?))
}

#[derive(Serialize)]
struct Tip {
    tip: String,
    generated: bool,
}

async fn tip(State(state): State<AppState>, current: CurrentUser) -> Result<Json<Tip>, AppError> {
    current.require_user()?;
    if let Some(vision) = state.vision.as_ref() {
        match vision.motivational_tip().await {
            Ok(tip) => {
                return Ok(Json(Tip {
                    tip,
                    generated: true,
                }))
            }
            Err(err) => warn!(error = %err, "tip generation failed, using fallback"),
        }
    }
    Ok(Json(Tip {
        tip: fallback_tip(Utc::now().ordinal()).to_string(),
        generated: false,
    }))
}

async fn raise_sos(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<NewSosAlert>,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    if let Some(ride_id) = form.ride_id.as_deref() {
        if state.rides.get_ride(ride_id).await?.is_none() {
            return Err(AppError::BadRequest("unknown ride".into()));
        }
    }
    let alert = state.alerts.raise(user, form).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}
