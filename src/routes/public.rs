use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::PrivateCookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::{
    auth::{self, Registration},
    error::AppError,
    models::user::UserProfile,
    services::{storage::ImageUpload, vision::VerificationOutcome},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(flatten)]
    registration: Registration,
    /// Base64 photo of the institutional ID card.
    #[serde(default)]
    id_card_image: Option<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    user: UserProfile,
    verification: VerificationOutcome,
}

async fn register(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Json(form): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id_card = form
        .id_card_image
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .map(ImageUpload::from_base64)
        .transpose()?;

    let user = auth::register_user(&state, &form.registration).await?;

    let verification = match id_card {
        Some(image) => match auth::verify_id_card(&state, &user, &image).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(user_id = user.id, error = %err, "id verification failed at signup");
                VerificationOutcome {
                    verified: false,
                    reason: "verification could not be completed, try again from your profile"
                        .into(),
                    extracted_name: None,
                }
            }
        },
        None => VerificationOutcome {
            verified: false,
            reason: "no ID card submitted".into(),
            extracted_name: None,
        },
    };

    let user = auth::load_user(&state, user.id).await?;
    let session_id = auth::create_session(&state, user.id).await?;
    Ok((
        StatusCode::CREATED,
        auth::apply_session_cookie(jar, &session_id),
        Json(RegisterResponse {
            user: user.profile(),
            verification,
        }),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Json(form): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth::authenticate_user(&state, &form.email, &form.password).await?;
    let user = auth::load_user(&state, authed.id).await?;
    let session_id = auth::create_session(&state, user.id).await?;
    Ok((
        auth::apply_session_cookie(jar, &session_id),
        Json(user.profile()),
    ))
}

async fn logout(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
) -> Result<impl IntoResponse, AppError> {
    if let Some(cookie) = jar.get(auth::SESSION_COOKIE) {
        auth::destroy_session(&state, cookie.value()).await?;
    }
    Ok((auth::clear_session_cookie(jar), StatusCode::NO_CONTENT))
}
