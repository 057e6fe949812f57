//! Notification types for trade confirmations and risk alerts.

use crate::types::TradeSummary;
use serde::{Deserialize, Serialize};

/// Why a risk alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAlertKind {
    /// A deferred order could not be covered when its trigger fired
    OrderCancelled,
    /// A strategy stopped after repeated failures
    StrategyPaused,
}

/// A risk alert for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlert {
    pub kind: RiskAlertKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub timestamp: i64,
}

impl RiskAlert {
    pub fn order_cancelled(trade_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: RiskAlertKind::OrderCancelled,
            message: message.into(),
            trade_id: Some(trade_id.to_string()),
            strategy_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn strategy_paused(strategy_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: RiskAlertKind::StrategyPaused,
            message: message.into(),
            trade_id: None,
            strategy_id: Some(strategy_id.to_string()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A message waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TradeExecuted {
        #[serde(rename = "userId")]
        user_id: String,
        summary: TradeSummary,
    },
    RiskAlert {
        #[serde(rename = "userId")]
        user_id: String,
        alert: RiskAlert,
    },
}

impl Notification {
    pub fn user_id(&self) -> &str {
        match self {
            Notification::TradeExecuted { user_id, .. } | Notification::RiskAlert { user_id, .. } => {
                user_id
            }
        }
    }
}
