//! Trades API
//!
//! - POST /api/trades - Submit an order
//! - GET /api/trades/:id - Get a trade
//! - GET /api/users/:user_id/trades - List a user's trades, newest first
//! - GET /api/portfolios/:user_id - Get a user's portfolio

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::Result;
use crate::types::{Portfolio, Trade, TradeRequest};
use crate::AppState;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trades", post(submit_trade))
        .route("/trades/:id", get(get_trade))
        .route("/users/:user_id/trades", get(list_trades))
        .route("/portfolios/:user_id", get(get_portfolio))
}

#[derive(Debug, Deserialize)]
pub struct ListTradesQuery {
    pub limit: Option<usize>,
}

/// POST /api/trades
async fn submit_trade(
    State(state): State<AppState>,
    Json(request): Json<TradeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Trade>>)> {
    let trade = state.trading.submit(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: trade })))
}

/// GET /api/trades/:id
async fn get_trade(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Trade>>> {
    let trade = state.trading.get_trade(&id).await?;
    Ok(Json(ApiResponse { data: trade }))
}

/// GET /api/users/:user_id/trades
async fn list_trades(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListTradesQuery>,
) -> Result<Json<ApiResponse<Vec<Trade>>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let trades = state.trading.list_trades(&user_id, limit).await?;
    Ok(Json(ApiResponse { data: trades }))
}

/// GET /api/portfolios/:user_id
///
/// Creates the portfolio with the default cash balance on first access.
async fn get_portfolio(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<Portfolio>>> {
    let portfolio = state.trading.portfolio(&user_id).await?;
    Ok(Json(ApiResponse { data: portfolio }))
}
