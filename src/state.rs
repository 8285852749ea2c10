use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};

use crate::{
    config::AppConfig,
    db::DbPool,
    services::{
        alerts::AlertStore, relay::LocationRelay, rides::RideStore, routing::RoutePlanner,
        storage::StorageService, vision::VisionModel,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub storage: StorageService,
    pub rides: RideStore,
    pub alerts: AlertStore,
    pub relay: LocationRelay,
    pub vision: Option<Arc<dyn VisionModel>>,
    pub planner: Option<Arc<dyn RoutePlanner>>,
    pub cookie_key: Key,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        storage: StorageService,
        vision: Option<Arc<dyn VisionModel>>,
        planner: Option<Arc<dyn RoutePlanner>>,
    ) -> Self {
        let digest = Sha512::digest(config.cookie_secret.as_bytes());
        let cookie_key = Key::from(&digest[..]);
        Self {
            rides: RideStore::new(db.clone()),
            alerts: AlertStore::new(db.clone()),
            relay: LocationRelay::new(),
            config,
            db,
            storage,
            vision,
            planner,
            cookie_key,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}
