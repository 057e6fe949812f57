use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient cash: need {needed}, have {available}")]
    InsufficientCash { needed: Decimal, available: Decimal },

    #[error("Insufficient holdings of {symbol}: requested {requested}, held {held}")]
    InsufficientHoldings {
        symbol: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("Position limit exceeded: at most {max} positions")]
    PositionLimitExceeded { max: usize },

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Trade already finalized: {0}")]
    TradeFinalized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Indicator error: {0}")]
    Indicator(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::InsufficientCash { .. } => "INSUFFICIENT_CASH",
            EngineError::InsufficientHoldings { .. } => "INSUFFICIENT_HOLDINGS",
            EngineError::PositionLimitExceeded { .. } => "POSITION_LIMIT",
            EngineError::PriceUnavailable(_) => "PRICE_UNAVAILABLE",
            EngineError::Persistence(_) => "PERSISTENCE",
            EngineError::VersionConflict(_) => "VERSION_CONFLICT",
            EngineError::TradeFinalized(_) => "TRADE_FINALIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Queue(_) => "QUEUE",
            EngineError::Notification(_) => "NOTIFICATION",
            EngineError::Indicator(_) => "INDICATOR",
        }
    }

    /// Errors worth retrying: the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PriceUnavailable(_)
                | EngineError::Persistence(_)
                | EngineError::VersionConflict(_)
                | EngineError::Queue(_)
                | EngineError::Notification(_)
                | EngineError::Indicator(_)
        )
    }

    /// Business-rule rejections that cancel an order at fill time.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::InsufficientCash { .. }
                | EngineError::InsufficientHoldings { .. }
                | EngineError::PositionLimitExceeded { .. }
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(format!("serialization: {}", e))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Queue(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::PriceUnavailable(e.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_)
            | EngineError::InsufficientCash { .. }
            | EngineError::InsufficientHoldings { .. }
            | EngineError::PositionLimitExceeded { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::TradeFinalized(_) | EngineError::VersionConflict(_) => {
                StatusCode::CONFLICT
            }
            EngineError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Persistence(_)
            | EngineError::Queue(_)
            | EngineError::Notification(_)
            | EngineError::Indicator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
