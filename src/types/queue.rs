//! Job Queue Types
//!
//! Delayed jobs driving the pending order monitor and the strategy scheduler.

use crate::types::{OrderAction, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kinds of work the engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Re-evaluate a pending trade against a fresh price
    MonitorOrder,
    /// Run one evaluation pass of a strategy
    ExecuteStrategy,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::MonitorOrder => "monitor_order",
            JobType::ExecuteStrategy => "execute_strategy",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Due now or in the future
    Waiting,
    /// Claimed by a worker
    Active,
    Completed,
    /// Retry budget exhausted
    Failed,
}

impl JobState {
    /// Live jobs block a new enqueue under the same id.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }
}

/// Options accepted by `JobQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub delay: Duration,
    /// Lower runs first among jobs due at the same instant
    pub priority: i32,
    /// Total attempts allowed, including the first
    pub attempts: u32,
    /// Deterministic id; a live job with the same id makes enqueue a no-op
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            priority: 0,
            attempts: 5,
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i32,
    /// Failed attempts so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// When the job becomes due (unix ms)
    pub run_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl Job {
    pub fn new(job_type: JobType, payload: serde_json::Value, opts: &JobOptions) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: opts
                .job_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            job_type,
            payload,
            state: JobState::Waiting,
            priority: opts.priority,
            attempts_made: 0,
            max_attempts: opts.attempts.max(1),
            run_at: now + opts.delay.as_millis() as i64,
            last_error: None,
            created_at: now,
        }
    }

    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::error::EngineError::Validation(format!("bad payload for job {}: {}", self.id, e))
        })
    }
}

/// Result of `JobQueue::fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailure {
    /// Scheduled for another attempt after the delay
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left; the job is parked as failed
    Exhausted { attempts: u32 },
}

/// Payload of a `monitor_order` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorJob {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: Decimal,
    pub order_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    pub trigger_price: Decimal,
}

impl MonitorJob {
    pub fn job_id(trade_id: &str) -> String {
        format!("monitor:{}", trade_id)
    }
}

impl From<&Trade> for MonitorJob {
    fn from(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id.clone(),
            user_id: trade.user_id.clone(),
            symbol: trade.symbol.clone(),
            action: trade.action,
            quantity: trade.quantity,
            order_type: trade.source.to_string(),
            limit_price: trade.source.limit_price(),
            stop_price: trade.source.stop_price(),
            trigger_price: trade.trigger_price,
        }
    }
}

/// Payload of an `execute_strategy` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyJob {
    pub strategy_id: String,
}

impl StrategyJob {
    pub fn job_id(strategy_id: &str) -> String {
        format!("strategy:{}", strategy_id)
    }
}
