use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    handlers::{health_handler, monitor_handler},
    infra::app_state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/monitor", post(monitor_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
