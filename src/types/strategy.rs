//! Strategy Types
//!
//! User-defined IF/THEN rules evaluated on a schedule.

use crate::error::{EngineError, Result};
use crate::types::{normalize_symbol, OrderAction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Enums
// =============================================================================

/// Strategy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    /// Strategy is scheduled and will place trades
    Active,
    /// Strategy is paused (manually or after repeated failures)
    Paused,
}

impl Default for StrategyStatus {
    fn default() -> Self {
        StrategyStatus::Paused
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyStatus::Active => write!(f, "active"),
            StrategyStatus::Paused => write!(f, "paused"),
        }
    }
}

/// How often an active strategy is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionFrequency {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl ExecutionFrequency {
    pub fn interval(&self) -> Duration {
        let secs = match self {
            ExecutionFrequency::OneMinute => 60,
            ExecutionFrequency::FiveMinutes => 5 * 60,
            ExecutionFrequency::FifteenMinutes => 15 * 60,
            ExecutionFrequency::OneHour => 60 * 60,
            ExecutionFrequency::FourHours => 4 * 60 * 60,
            ExecutionFrequency::OneDay => 24 * 60 * 60,
        };
        Duration::from_secs(secs)
    }
}

impl Default for ExecutionFrequency {
    fn default() -> Self {
        ExecutionFrequency::FiveMinutes
    }
}

/// Indicators a rule condition can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Price,
    Rsi,
    Ema,
    Macd,
    Bollinger,
    Volume,
    Stochastic,
}

impl std::fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorType::Price => write!(f, "price"),
            IndicatorType::Rsi => write!(f, "rsi"),
            IndicatorType::Ema => write!(f, "ema"),
            IndicatorType::Macd => write!(f, "macd"),
            IndicatorType::Bollinger => write!(f, "bollinger"),
            IndicatorType::Volume => write!(f, "volume"),
            IndicatorType::Stochastic => write!(f, "stochastic"),
        }
    }
}

/// Comparison operators for rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThan,
    LessThan,
    EqualTo,
    GreaterEqual,
    LessEqual,
    CrossesAbove,
    CrossesBelow,
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparisonOperator::GreaterThan => write!(f, "greater than"),
            ComparisonOperator::LessThan => write!(f, "less than"),
            ComparisonOperator::EqualTo => write!(f, "equal to"),
            ComparisonOperator::GreaterEqual => write!(f, "at or above"),
            ComparisonOperator::LessEqual => write!(f, "at or below"),
            ComparisonOperator::CrossesAbove => write!(f, "crossed above"),
            ComparisonOperator::CrossesBelow => write!(f, "crossed below"),
        }
    }
}

/// How a rule action's quantity is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityType {
    /// Fixed number of shares/units
    Shares,
    /// Dollar amount, converted at the live price
    Dollars,
    /// Percent of cash (BUY) or of the held position (SELL)
    Percentage,
}

impl Default for QuantityType {
    fn default() -> Self {
        QuantityType::Shares
    }
}

// =============================================================================
// Rules
// =============================================================================

/// IF part of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub indicator: IndicatorType,
    pub operator: ComparisonOperator,
    /// Threshold compared against
    pub value: Decimal,
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
}

fn default_timeframe() -> String {
    "1d".to_string()
}

impl RuleCondition {
    pub fn price(symbol: &str, operator: ComparisonOperator, value: Decimal) -> Self {
        Self {
            indicator: IndicatorType::Price,
            operator,
            value,
            symbol: symbol.to_string(),
            timeframe: default_timeframe(),
        }
    }
}

/// THEN part of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: OrderAction,
    pub quantity: Decimal,
    #[serde(default)]
    pub quantity_type: QuantityType,
}

/// A single rule inside a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub condition: RuleCondition,
    pub action: RuleAction,
    #[serde(default)]
    pub cooldown_minutes: u32,
    /// Last time this rule fired (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<i64>,
    /// Price seen on the previous evaluation, for cross detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<Decimal>,
}

fn default_true() -> bool {
    true
}

impl StrategyRule {
    pub fn new(condition: RuleCondition, action: RuleAction, cooldown_minutes: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            enabled: true,
            condition,
            action,
            cooldown_minutes,
            last_executed: None,
            previous_price: None,
        }
    }

    /// A rule may not fire again until its cooldown has fully elapsed.
    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        match self.last_executed {
            Some(last) => now_ms - last < i64::from(self.cooldown_minutes) * 60_000,
            None => false,
        }
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Outcome recorded for a rule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    Executed,
    Pending,
    Failed,
}

/// One entry in a strategy's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub rule_id: String,
    pub symbol: String,
    pub action: OrderAction,
    pub price: Decimal,
    /// Signal confidence (0.0-1.0)
    pub confidence: f64,
    pub reason: String,
    pub status: ExecutionLogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    pub timestamp: i64,
}

/// An automated strategy owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StrategyStatus,
    #[serde(default)]
    pub frequency: ExecutionFrequency,
    #[serde(default)]
    pub rules: Vec<StrategyRule>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
    /// Consecutive runs with at least one failed rule
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Strategy {
    pub fn new(user_id: &str, name: &str, frequency: ExecutionFrequency) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: None,
            status: StrategyStatus::Paused,
            frequency,
            rules: Vec::new(),
            execution_log: Vec::new(),
            consecutive_failures: 0,
            pause_reason: None,
            last_executed: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_rule(mut self, rule: StrategyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == StrategyStatus::Active
    }

    pub fn activate(&mut self) {
        self.status = StrategyStatus::Active;
        self.consecutive_failures = 0;
        self.pause_reason = None;
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    pub fn pause(&mut self, reason: Option<String>) {
        self.status = StrategyStatus::Paused;
        self.pause_reason = reason;
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Append to the execution log, dropping the oldest entries beyond `cap`.
    pub fn push_log(&mut self, entry: ExecutionLogEntry, cap: usize) {
        self.execution_log.push(entry);
        if self.execution_log.len() > cap {
            let excess = self.execution_log.len() - cap;
            self.execution_log.drain(..excess);
        }
    }

    /// Record the outcome of a run. Returns true when the strategy was paused.
    pub fn record_run(&mut self, failed: bool, failure_limit: u32) -> bool {
        if !failed {
            self.consecutive_failures = 0;
            return false;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= failure_limit && self.is_active() {
            self.pause(Some(format!(
                "paused after {} consecutive failed executions",
                self.consecutive_failures
            )));
            return true;
        }
        false
    }
}

/// Request to create a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStrategyRequest {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub frequency: ExecutionFrequency,
    pub rules: Vec<NewRule>,
    #[serde(default)]
    pub activate: bool,
}

/// Rule definition as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRule {
    #[serde(default)]
    pub name: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    #[serde(default)]
    pub cooldown_minutes: u32,
}

impl CreateStrategyRequest {
    /// Validate the request and normalize rule symbols to upper case.
    pub fn validate(&mut self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation("user id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("strategy name is required".to_string()));
        }
        if self.rules.is_empty() {
            return Err(EngineError::Validation(
                "a strategy needs at least one rule".to_string(),
            ));
        }

        for rule in &mut self.rules {
            rule.condition.symbol = normalize_symbol(&rule.condition.symbol)?;
            if rule.action.quantity <= Decimal::ZERO {
                return Err(EngineError::Validation(
                    "rule quantity must be positive".to_string(),
                ));
            }
            if rule.action.quantity_type == QuantityType::Percentage
                && rule.action.quantity > Decimal::ONE_HUNDRED
            {
                return Err(EngineError::Validation(
                    "percentage quantity cannot exceed 100".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn into_strategy(self) -> Strategy {
        let mut strategy = Strategy::new(&self.user_id, &self.name, self.frequency);
        strategy.description = self.description;
        strategy.rules = self
            .rules
            .into_iter()
            .map(|r| {
                let mut rule = StrategyRule::new(r.condition, r.action, r.cooldown_minutes);
                rule.name = r.name;
                rule
            })
            .collect();
        if self.activate {
            strategy.activate();
        }
        strategy
    }
}
