use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    db::DbPool,
    error::AppError,
    models::{
        alert::{AlertStatus, SosAlert},
        location::Coordinate,
    },
};

const FEED_CAPACITY: usize = 128;

const ALERT_SELECT: &str = r#"
SELECT a.id, a.user_id, u.name AS user_name, u.email AS user_email, a.ride_id,
       a.lat, a.lng, a.message, a.status, a.created_at, a.resolved_at, a.resolved_by
FROM sos_alerts a JOIN users u ON u.id = a.user_id
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct NewSosAlert {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub ride_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// SOS alerts plus the live feed admins watch.
#[derive(Clone)]
pub struct AlertStore {
    db: DbPool,
    feed: broadcast::Sender<SosAlert>,
}

impl AlertStore {
    pub fn new(db: DbPool) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { db, feed }
    }

    pub async fn raise(
        &self,
        user: &AuthenticatedUser,
        alert: NewSosAlert,
    ) -> Result<SosAlert, AppError> {
        let position = Coordinate::new(alert.lat, alert.lng);
        if !position.is_valid() {
            return Err(AppError::BadRequest("alert coordinates are out of range".into()));
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO sos_alerts (id, user_id, ride_id, lat, lng, message, status, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )
        .bind(&id)
        .bind(user.id)
        .bind(&alert.ride_id)
        .bind(position.lat)
        .bind(position.lng)
        .bind(alert.message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()))
        .bind(AlertStatus::Active.as_str())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        let saved = self.require(&id).await?;
        warn!(alert_id = %id, user = user.id, lat = position.lat, lng = position.lng, "SOS raised");
        self.announce(saved.clone());
        Ok(saved)
    }

    /// `ACTIVE` → `RESOLVED`, once.
    pub async fn resolve(&self, alert_id: &str, admin_id: i64) -> Result<SosAlert, AppError> {
        let existing = self.require(alert_id).await?;
        let result = sqlx::query(
            "UPDATE sos_alerts SET status = ?1, resolved_at = ?2, resolved_by = ?3 WHERE id = ?4 AND status = ?5",
        )
        .bind(AlertStatus::Resolved.as_str())
        .bind(Utc::now())
        .bind(admin_id)
        .bind(alert_id)
        .bind(AlertStatus::Active.as_str())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "alert is already {}",
                existing.status()
            )));
        }
        let resolved = self.require(alert_id).await?;
        info!(alert_id, admin = admin_id, "SOS resolved");
        self.announce(resolved.clone());
        Ok(resolved)
    }

    pub async fn get(&self, alert_id: &str) -> Result<Option<SosAlert>, AppError> {
        let alert = sqlx::query_as(&format!("{ALERT_SELECT} WHERE a.id = ?1"))
            .bind(alert_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(alert)
    }

    async fn require(&self, alert_id: &str) -> Result<SosAlert, AppError> {
        self.get(alert_id).await?.ok_or(AppError::NotFound)
    }

    /// Newest first, optionally narrowed to one status.
    pub async fn list(&self, status: Option<AlertStatus>) -> Result<Vec<SosAlert>, AppError> {
        let alerts: Vec<SosAlert> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "{ALERT_SELECT} WHERE a.status = ?1 ORDER BY a.created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as(&format!("{ALERT_SELECT} ORDER BY a.created_at DESC"))
                    .fetch_all(&self.db)
                    .await?
            }
        };
        Ok(alerts)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SosAlert> {
        self.feed.subscribe()
    }

    /// Live alert changes for the admin feed.
    pub fn feed(&self) -> impl Stream<Item = SosAlert> + Send + 'static {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(alert) => return Some((alert, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "admin alert feed lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    fn announce(&self, alert: SosAlert) {
        // No admin listening is not an error; the alert is already stored.
        let _ = self.feed.send(alert);
    }
}
