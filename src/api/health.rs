//! GET /api/health - liveness plus a store read.

use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    queue: &'static str,
    /// Pending trades awaiting a trigger; absent when the store is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_trades: Option<usize>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pending_trades = match state.store.find_pending_trades().await {
        Ok(trades) => Some(trades.len()),
        Err(e) => {
            warn!("Health check could not reach the store: {}", e);
            None
        }
    };

    Json(HealthResponse {
        status: if pending_trades.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        queue: if state.config.redis_url.is_some() {
            "redis"
        } else {
            "memory"
        },
        pending_trades,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
