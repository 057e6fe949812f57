//! Strategies API
//!
//! - POST /api/strategies - Create a strategy (optionally active)
//! - GET /api/strategies/:id - Get a strategy with its execution log
//! - POST /api/strategies/:id/activate - Activate and schedule
//! - POST /api/strategies/:id/pause - Pause

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::time::Duration;

use crate::api::ApiResponse;
use crate::error::{EngineError, Result};
use crate::types::{CreateStrategyRequest, Strategy};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_strategy))
        .route("/:id", get(get_strategy))
        .route("/:id/activate", post(activate_strategy))
        .route("/:id/pause", post(pause_strategy))
}

/// POST /api/strategies
async fn create_strategy(
    State(state): State<AppState>,
    Json(mut request): Json<CreateStrategyRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Strategy>>)> {
    request.validate()?;
    state
        .strategies
        .check_rules(request.rules.iter().map(|rule| &rule.condition))?;
    let strategy = request.into_strategy();
    state.store.save_strategy(&strategy).await?;

    if strategy.is_active() {
        state.scheduler.schedule(&strategy, Duration::ZERO).await?;
    }

    Ok((StatusCode::CREATED, Json(ApiResponse { data: strategy })))
}

/// GET /api/strategies/:id
async fn get_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Strategy>>> {
    let strategy = state
        .store
        .find_strategy(&id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("strategy {}", id)))?;
    Ok(Json(ApiResponse { data: strategy }))
}

/// POST /api/strategies/:id/activate
async fn activate_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Strategy>>> {
    let strategy = state.scheduler.activate(&id).await?;
    Ok(Json(ApiResponse { data: strategy }))
}

/// POST /api/strategies/:id/pause
async fn pause_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Strategy>>> {
    let strategy = state.scheduler.pause(&id).await?;
    Ok(Json(ApiResponse { data: strategy }))
}
