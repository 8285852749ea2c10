use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UserRole {
    #[default]
    #[serde(rename = "user")]
    User,
    #[serde(rename = "admin")]
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(UserRole::User),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub email: String,
    pub domain: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub id_verified: bool,
    pub aadhar_verified: bool,
    pub id_card_image: Option<String>,
    pub profile_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Unknown role strings degrade to the least privileged role.
    pub fn role(&self) -> UserRole {
        self.role.parse().unwrap_or_default()
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            domain: self.domain.clone(),
            phone: self.phone.clone(),
            role: self.role(),
            id_verified: self.id_verified,
            aadhar_verified: self.aadhar_verified,
            profile_image: self.profile_image.clone(),
            created_at: self.created_at,
        }
    }
}

/// The user record as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub email: String,
    pub domain: String,
    pub phone: Option<String>,
    pub role: UserRole,
    pub id_verified: bool,
    pub aadhar_verified: bool,
    pub profile_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Returns the lowercase organization domain of an email address.
pub fn email_domain(email: &str) -> Option<String> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || local.contains(char::is_whitespace) {
        return None;
    }
    let domain = domain.to_lowercase();
    let valid = domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(domain)
}
