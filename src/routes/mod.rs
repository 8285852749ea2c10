pub mod admin;
pub mod live;
pub mod public;
pub mod rides;
pub mod trips;
pub mod user;

use axum::Router;
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let static_root = state.config.static_root.clone();
    // Unknown paths fall through to the single-page app.
    let spa = ServeDir::new(&static_root).fallback(ServeFile::new(static_root.join("index.html")));

    Router::new()
        .merge(public::router())
        .merge(rides::router())
        .nest(
            "/api/me",
            user::router().merge(trips::router()).merge(live::router()),
        )
        .nest("/admin", admin::router())
        .fallback_service(spa)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
