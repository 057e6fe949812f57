pub mod health;
pub mod strategies;
pub mod trades;

use crate::AppState;
use axum::Router;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Success envelope for every API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api", trades::router())
        .nest("/api/strategies", strategies::router())
}

/// Router with state and middleware applied.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
