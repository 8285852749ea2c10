use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        session::Session,
        user::{email_domain, User, UserRole},
    },
    services::{
        storage::{ImageKind, ImageUpload},
        vision::{assess_id_card, VerificationOutcome},
    },
    state::AppState,
};

pub const SESSION_COOKIE: &str = "carpool_session";
const SESSION_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 8;
const DUPLICATE_EMAIL: &str = "an account with this email already exists";

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub email: String,
    pub domain: String,
    pub role: UserRole,
}

impl From<&User> for AuthenticatedUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            uuid: user.uuid.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            domain: user.domain.clone(),
            role: user.role(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<AuthenticatedUser>);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Already resolved upstream (tests, or a layer that authenticated the request).
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(Self(Some(user.clone())));
        }

        let jar = PrivateCookieJar::from_headers(&parts.headers, state.cookie_key.clone());
        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return Ok(Self(None));
        };
        Ok(Self(resolve_session(state, cookie.value()).await?))
    }
}

impl CurrentUser {
    pub fn require_user(&self) -> Result<&AuthenticatedUser, AppError> {
        self.0.as_ref().ok_or(AppError::Unauthorized)
    }

    pub fn require_admin(&self) -> Result<&AuthenticatedUser, AppError> {
        let user = self.require_user()?;
        if user.role == UserRole::Admin {
            Ok(user)
        } else {
            Err(AppError::Forbidden)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

pub async fn register_user(state: &AppState, form: &Registration) -> Result<User, AppError> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    let email = form.email.trim().to_lowercase();
    let domain = email_domain(&email)
        .ok_or_else(|| AppError::BadRequest("a valid institutional email is required".into()))?;
    if !state.config.allows_domain(&domain) {
        return Err(AppError::BadRequest(format!(
            "{domain} is not a participating institution"
        )));
    }
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ?1")
        .bind(&email)
        .fetch_one(&state.db)
        .await?;
    if taken > 0 {
        return Err(AppError::Conflict(DUPLICATE_EMAIL.into()));
    }

    let password_hash = hash_password(&form.password)?;
    let uuid = Uuid::new_v4().to_string();
    let phone = form
        .phone
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());
    let id = sqlx::query(
        r#"INSERT INTO users (uuid, name, email, domain, phone, password_hash, role, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
    )
    .bind(&uuid)
    .bind(name)
    .bind(&email)
    .bind(&domain)
    .bind(phone)
    .bind(password_hash)
    .bind(UserRole::User.as_str())
    .bind(Utc::now())
    .execute(&state.db)
    .await
    .map_err(|err| AppError::unique_as_conflict(err, DUPLICATE_EMAIL))?
    .last_insert_rowid();

    info!(user_id = id, domain = %domain, "user registered");
    load_user(state, id).await
}

pub async fn authenticate_user(
    state: &AppState,
    email: &str,
    password: &str,
) -> Result<AuthenticatedUser, AppError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?1")
        .bind(email.trim().to_lowercase())
        .fetch_optional(&state.db)
        .await?;
    let Some(user) = user else {
        return Err(AppError::Unauthorized);
    };
    if !verify_password(password, &user.password_hash) {
        warn!(user_id = user.id, "failed login");
        return Err(AppError::Unauthorized);
    }
    sqlx::query("UPDATE users SET last_login_at = ?1 WHERE id = ?2")
        .bind(Utc::now())
        .bind(user.id)
        .execute(&state.db)
        .await?;
    Ok(AuthenticatedUser::from(&user))
}

pub async fn load_user(state: &AppState, user_id: i64) -> Result<User, AppError> {
    sqlx::query_as("SELECT * FROM users WHERE id = ?1")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)
}

pub async fn create_session(state: &AppState, user_id: i64) -> Result<String, AppError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, created_at, last_seen_at, expires_at) VALUES (?1, ?2, ?3, ?3, ?4)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(now)
    .bind(now + Duration::days(SESSION_DAYS))
    .execute(&state.db)
    .await?;
    Ok(id)
}

pub async fn destroy_session(state: &AppState, session_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?1")
        .bind(session_id)
        .execute(&state.db)
        .await?;
    Ok(())
}

async fn resolve_session(
    state: &AppState,
    session_id: &str,
) -> Result<Option<AuthenticatedUser>, AppError> {
    let session: Option<Session> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?1")
        .bind(session_id)
        .fetch_optional(&state.db)
        .await?;
    let Some(session) = session else {
        return Ok(None);
    };
    let now = Utc::now();
    if session.is_expired(now) {
        destroy_session(state, &session.id).await?;
        return Ok(None);
    }
    sqlx::query("UPDATE sessions SET last_seen_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(&session.id)
        .execute(&state.db)
        .await?;
    match load_user(state, session.user_id).await {
        Ok(user) => Ok(Some(AuthenticatedUser::from(&user))),
        Err(AppError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn apply_session_cookie(jar: PrivateCookieJar, session_id: &str) -> PrivateCookieJar {
    let cookie = Cookie::build((SESSION_COOKIE, session_id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .permanent();
    jar.add(cookie)
}

pub fn clear_session_cookie(jar: PrivateCookieJar) -> PrivateCookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
}

/// Stores the card image, asks the vision model about it and records the result.
pub async fn verify_id_card(
    state: &AppState,
    user: &User,
    image: &ImageUpload,
) -> Result<VerificationOutcome, AppError> {
    let reference = state
        .storage
        .save_user_image(&user.uuid, ImageKind::IdCard, image)
        .await?;
    sqlx::query("UPDATE users SET id_card_image = ?1 WHERE id = ?2")
        .bind(&reference)
        .bind(user.id)
        .execute(&state.db)
        .await?;

    let Some(vision) = state.vision.as_ref() else {
        return Ok(VerificationOutcome::skipped());
    };
    let analysis = vision.analyze_id_card(image).await?;
    let outcome = assess_id_card(&analysis, &user.name);
    sqlx::query("UPDATE users SET id_verified = ?1 WHERE id = ?2")
        .bind(outcome.verified)
        .bind(user.id)
        .execute(&state.db)
        .await?;
    info!(user_id = user.id, verified = outcome.verified, reason = %outcome.reason, "id card checked");
    Ok(outcome)
}

fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::Other(anyhow::anyhow!("password hashing failed: {err}")))
}

fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correct horse").expect("hash");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }
}
