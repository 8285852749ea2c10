use std::sync::Arc;

use carpool::config::AppConfig;
use carpool::db::{init_pool, run_migrations};
use carpool::error::AppError;
use carpool::routes::create_router;
use carpool::services::{
    routing::{OsrmClient, RoutePlanner},
    storage::StorageService,
    vision::{GeminiClient, VisionModel},
};
use carpool::state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;

    if let Err(err) = run_migrations(&db).await {
        error!("migration failed: {err:?}");
        return Err(err);
    }

    let storage = StorageService::new(config.data_root.clone());
    storage.ensure_structure().await?;

    let vision: Option<Arc<dyn VisionModel>> = match config.ai.clone() {
        Some(ai) => {
            info!(model = %ai.model, "identity verification enabled");
            Some(Arc::new(GeminiClient::new(ai)?))
        }
        None => {
            info!("AI_API_KEY not set, identity verification disabled");
            None
        }
    };
    let planner: Option<Arc<dyn RoutePlanner>> = match config.osrm_url.clone() {
        Some(url) => {
            info!(%url, "road routing enabled");
            Some(Arc::new(OsrmClient::new(url)?))
        }
        None => None,
    };

    let state = AppState::new(config.clone(), db, storage, vision, planner);
    let app = create_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,carpool=debug,tower_http=info".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
