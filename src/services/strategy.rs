//! Strategy rule engine.
//!
//! Evaluates every enabled rule of an active strategy against live prices
//! and submits an order for each rule whose condition holds. A failing rule
//! is logged and counted; it never stops its siblings.

use crate::config::StrategyConfig;
use crate::error::{EngineError, Result};
use crate::services::notify::NotificationOutbox;
use crate::services::price::{PriceOracle, QuoteCache};
use crate::services::queue::JobQueue;
use crate::services::store::Store;
use crate::services::trading::TradingService;
use crate::services::worker::{JobHandler, JobOutcome};
use crate::types::{
    normalize_symbol, truncate_quantity, ComparisonOperator, ExecutionLogEntry,
    ExecutionLogStatus, IndicatorType, Job, JobOptions, JobType, OrderAction, OrderSource,
    QuantityType, RiskAlert, RuleCondition, Strategy, StrategyJob, StrategyRule, StrategyStatus,
    TradeRequest, TradeStatus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Absolute tolerance for `equal_to`.
pub const EQUAL_TOLERANCE: Decimal = dec!(0.01);

/// Confidence reported for non-price indicators.
const INDICATOR_CONFIDENCE: f64 = 0.75;

/// Apply a comparison operator. Crosses need the value seen on the previous
/// evaluation and are false without one.
pub fn compare(
    operator: ComparisonOperator,
    current: Decimal,
    previous: Option<Decimal>,
    threshold: Decimal,
) -> bool {
    match operator {
        ComparisonOperator::GreaterThan => current > threshold,
        ComparisonOperator::LessThan => current < threshold,
        ComparisonOperator::EqualTo => (current - threshold).abs() <= EQUAL_TOLERANCE,
        ComparisonOperator::GreaterEqual => current >= threshold,
        ComparisonOperator::LessEqual => current <= threshold,
        ComparisonOperator::CrossesAbove => {
            previous.map_or(false, |p| p <= threshold && current > threshold)
        }
        ComparisonOperator::CrossesBelow => {
            previous.map_or(false, |p| p >= threshold && current < threshold)
        }
    }
}

/// Confidence of a price signal: grows with distance from the threshold.
pub fn price_confidence(price: Decimal, threshold: Decimal) -> f64 {
    if threshold.is_zero() {
        return 0.5;
    }
    let distance = ((price - threshold).abs() / threshold.abs())
        .to_f64()
        .unwrap_or(0.0);
    (0.5 + distance * 10.0).clamp(0.5, 1.0)
}

// =============================================================================
// Indicators
// =============================================================================

/// Evaluates conditions on indicators other than price.
#[async_trait]
pub trait IndicatorEvaluator: Send + Sync {
    async fn evaluate(&self, condition: &RuleCondition, price: Decimal) -> Result<bool>;

    /// Whether rules on `indicator` can ever be evaluated.
    fn supports(&self, indicator: IndicatorType) -> bool {
        let _ = indicator;
        true
    }
}

/// Evaluator for deployments without an indicator feed: only price rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriceOnlyIndicators;

#[async_trait]
impl IndicatorEvaluator for PriceOnlyIndicators {
    async fn evaluate(&self, condition: &RuleCondition, _price: Decimal) -> Result<bool> {
        Err(EngineError::Indicator(format!(
            "no feed for {} readings",
            condition.indicator
        )))
    }

    fn supports(&self, indicator: IndicatorType) -> bool {
        indicator == IndicatorType::Price
    }
}

type IndicatorKey = (String, String, IndicatorType);

/// Indicator values pushed in from outside, keyed by symbol and timeframe.
#[derive(Default)]
pub struct SnapshotIndicators {
    values: DashMap<IndicatorKey, (Decimal, Option<Decimal>)>,
}

impl SnapshotIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reading; the old one becomes the previous value.
    pub fn push(&self, symbol: &str, timeframe: &str, indicator: IndicatorType, value: Decimal) {
        let key = (symbol.to_uppercase(), timeframe.to_string(), indicator);
        self.values
            .entry(key)
            .and_modify(|(current, previous)| {
                *previous = Some(*current);
                *current = value;
            })
            .or_insert((value, None));
    }
}

#[async_trait]
impl IndicatorEvaluator for SnapshotIndicators {
    async fn evaluate(&self, condition: &RuleCondition, _price: Decimal) -> Result<bool> {
        let key = (
            condition.symbol.to_uppercase(),
            condition.timeframe.clone(),
            condition.indicator,
        );
        let (current, previous) = self
            .values
            .get(&key)
            .map(|v| *v)
            .ok_or_else(|| {
                EngineError::Indicator(format!(
                    "no {} reading for {} {}",
                    condition.indicator, condition.symbol, condition.timeframe
                ))
            })?;
        Ok(compare(condition.operator, current, previous, condition.value))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Outcome of one strategy pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyRun {
    pub evaluated: usize,
    pub fired: usize,
    pub failed: usize,
    pub paused: bool,
}

struct Signal {
    price: Decimal,
    met: bool,
    confidence: f64,
}

pub struct StrategyEngine {
    store: Arc<dyn Store>,
    oracle: Arc<dyn PriceOracle>,
    trading: Arc<TradingService>,
    indicators: Arc<dyn IndicatorEvaluator>,
    outbox: NotificationOutbox,
    config: StrategyConfig,
}

impl StrategyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn PriceOracle>,
        trading: Arc<TradingService>,
        indicators: Arc<dyn IndicatorEvaluator>,
        outbox: NotificationOutbox,
        config: StrategyConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            trading,
            indicators,
            outbox,
            config,
        }
    }

    /// Reject rules on indicators this engine cannot evaluate.
    pub fn check_rules<'a>(
        &self,
        conditions: impl IntoIterator<Item = &'a RuleCondition>,
    ) -> Result<()> {
        let unsupported = conditions
            .into_iter()
            .map(|condition| condition.indicator)
            .find(|indicator| {
                *indicator != IndicatorType::Price && !self.indicators.supports(*indicator)
            });

        match unsupported {
            Some(indicator) => Err(EngineError::Validation(format!(
                "{} rules are not available on this engine",
                indicator
            ))),
            None => Ok(()),
        }
    }

    /// Load, run and persist a strategy. Returns `None` when it is missing
    /// or not active.
    pub async fn execute(&self, strategy_id: &str) -> Result<Option<Strategy>> {
        let Some(mut strategy) = self.store.find_strategy(strategy_id).await? else {
            debug!("Strategy {} not found", strategy_id);
            return Ok(None);
        };
        if !strategy.is_active() {
            debug!("Strategy {} is {}, skipping", strategy_id, strategy.status);
            return Ok(None);
        }

        let run = self.run(&mut strategy).await;

        // A pause that landed while the rules ran wins over our copy.
        if let Some(stored) = self.store.find_strategy(strategy_id).await? {
            if stored.status == StrategyStatus::Paused && strategy.is_active() {
                strategy.status = StrategyStatus::Paused;
                strategy.pause_reason = stored.pause_reason;
            }
        }
        self.store.save_strategy(&strategy).await?;

        debug!(
            "Strategy {} run: {} evaluated, {} fired, {} failed",
            strategy.id, run.evaluated, run.fired, run.failed
        );
        Ok(Some(strategy))
    }

    /// Evaluate every eligible rule and record the outcome on the strategy.
    /// Does not persist.
    pub async fn run(&self, strategy: &mut Strategy) -> StrategyRun {
        let now = chrono::Utc::now().timestamp_millis();
        let mut quotes = QuoteCache::new(self.oracle.as_ref());
        let mut run = StrategyRun::default();

        for index in 0..strategy.rules.len() {
            let rule = strategy.rules[index].clone();
            if !rule.enabled || rule.is_cooling_down(now) {
                continue;
            }
            run.evaluated += 1;

            let signal = match self.evaluate_rule(&rule, &mut quotes).await {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Rule {} of strategy {} failed to evaluate: {}", rule.id, strategy.id, e);
                    run.failed += 1;
                    continue;
                }
            };
            strategy.rules[index].previous_price = Some(signal.price);

            if !signal.met {
                continue;
            }

            let (status, trade_id) = match self.fire(strategy, &rule, signal.price).await {
                Ok((status, trade_id)) => {
                    strategy.rules[index].last_executed = Some(now);
                    run.fired += 1;
                    (status, Some(trade_id))
                }
                Err(e) => {
                    error!("Rule {} of strategy {} failed to trade: {}", rule.id, strategy.id, e);
                    run.failed += 1;
                    (ExecutionLogStatus::Failed, None)
                }
            };

            strategy.push_log(
                ExecutionLogEntry {
                    rule_id: rule.id.clone(),
                    symbol: rule.condition.symbol.to_uppercase(),
                    action: rule.action.action_type,
                    price: signal.price,
                    confidence: signal.confidence,
                    reason: describe(&rule, signal.price),
                    status,
                    trade_id,
                    timestamp: now,
                },
                self.config.execution_log_cap,
            );
        }

        strategy.last_executed = Some(now);
        strategy.updated_at = now;

        if strategy.record_run(run.failed > 0, self.config.failure_limit) {
            run.paused = true;
            warn!(
                "Strategy {} paused after {} consecutive failures",
                strategy.id, strategy.consecutive_failures
            );
            self.outbox.risk_alert(
                &strategy.user_id,
                RiskAlert::strategy_paused(
                    &strategy.id,
                    format!(
                        "Strategy \"{}\" was paused after {} consecutive failed executions",
                        strategy.name, strategy.consecutive_failures
                    ),
                ),
            );
        }

        run
    }

    async fn evaluate_rule(&self, rule: &StrategyRule, quotes: &mut QuoteCache<'_>) -> Result<Signal> {
        let symbol = normalize_symbol(&rule.condition.symbol)?;
        let price = quotes.price(&symbol).await?;
        let condition = &rule.condition;

        let (met, confidence) = match condition.indicator {
            IndicatorType::Price => (
                compare(condition.operator, price, rule.previous_price, condition.value),
                price_confidence(price, condition.value),
            ),
            _ => (
                self.indicators.evaluate(condition, price).await?,
                INDICATOR_CONFIDENCE,
            ),
        };

        Ok(Signal {
            price,
            met,
            confidence,
        })
    }

    /// Submit the rule's order. Returns the log status and trade id.
    async fn fire(
        &self,
        strategy: &Strategy,
        rule: &StrategyRule,
        price: Decimal,
    ) -> Result<(ExecutionLogStatus, String)> {
        let symbol = normalize_symbol(&rule.condition.symbol)?;
        let quantity = self
            .resolve_quantity(&strategy.user_id, &symbol, rule, price)
            .await?;

        let request = TradeRequest {
            user_id: strategy.user_id.clone(),
            symbol,
            action: rule.action.action_type,
            quantity,
            source: OrderSource::Market,
            strategy_id: Some(strategy.id.clone()),
        };

        let trade = self.trading.submit(request).await?;
        info!(
            "Strategy {} rule {} placed trade {} ({})",
            strategy.id, rule.id, trade.id, trade.status
        );

        let status = match trade.status {
            TradeStatus::Executed => ExecutionLogStatus::Executed,
            TradeStatus::Pending => ExecutionLogStatus::Pending,
            TradeStatus::Cancelled => ExecutionLogStatus::Failed,
        };
        Ok((status, trade.id))
    }

    /// Turn the rule's quantity into units of the symbol.
    async fn resolve_quantity(
        &self,
        user_id: &str,
        symbol: &str,
        rule: &StrategyRule,
        price: Decimal,
    ) -> Result<Decimal> {
        let action = &rule.action;
        let raw = match action.quantity_type {
            QuantityType::Shares => Some(action.quantity),
            QuantityType::Dollars => action.quantity.checked_div(price),
            QuantityType::Percentage => {
                let fraction = action.quantity / Decimal::ONE_HUNDRED;
                let portfolio = self.trading.portfolio(user_id).await?;
                match action.action_type {
                    OrderAction::Buy => (portfolio.cash * fraction).checked_div(price),
                    OrderAction::Sell => Some(portfolio.holding(symbol) * fraction),
                }
            }
        };
        let raw = raw.ok_or_else(|| {
            EngineError::Validation(format!(
                "rule {} quantity at {} is out of range",
                rule.id, price
            ))
        })?;

        let quantity = truncate_quantity(raw);
        if quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "rule {} resolves to a zero quantity of {}",
                rule.id, symbol
            )));
        }
        Ok(quantity)
    }
}

fn describe(rule: &StrategyRule, price: Decimal) -> String {
    let condition = &rule.condition;
    format!(
        "{} {} {} {} (current price {})",
        condition.symbol.to_uppercase(),
        condition.indicator,
        condition.operator,
        condition.value,
        price
    )
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives `execute_strategy` jobs. Each job re-schedules itself at the
/// strategy's frequency while the strategy stays active.
pub struct StrategyScheduler {
    engine: Arc<StrategyEngine>,
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    max_attempts: u32,
}

impl StrategyScheduler {
    pub fn new(
        engine: Arc<StrategyEngine>,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        max_attempts: u32,
    ) -> Self {
        Self {
            engine,
            store,
            queue,
            max_attempts,
        }
    }

    /// Queue a run of the strategy after `delay`.
    pub async fn schedule(&self, strategy: &Strategy, delay: Duration) -> Result<String> {
        let payload = serde_json::to_value(StrategyJob {
            strategy_id: strategy.id.clone(),
        })?;
        let opts = JobOptions::with_id(StrategyJob::job_id(&strategy.id))
            .delay(delay)
            .attempts(self.max_attempts);
        self.queue.enqueue(JobType::ExecuteStrategy, payload, opts).await
    }

    /// Seed a job for every active strategy.
    pub async fn schedule_active(&self) -> Result<usize> {
        let strategies = self.store.find_active_strategies().await?;
        for strategy in &strategies {
            self.schedule(strategy, Duration::ZERO).await?;
        }
        info!("Scheduled {} active strategies", strategies.len());
        Ok(strategies.len())
    }

    /// Schedule every active strategy that has no live job.
    ///
    /// Recovers strategies whose job exhausted its retries or was lost.
    pub async fn requeue_idle(&self) -> Result<usize> {
        let mut requeued = 0;
        for strategy in self.store.find_active_strategies().await? {
            if self.queue.has_live_job(&StrategyJob::job_id(&strategy.id)).await? {
                continue;
            }
            self.schedule(&strategy, Duration::ZERO).await?;
            requeued += 1;
        }

        if requeued > 0 {
            warn!("Re-scheduled {} idle strategies", requeued);
        }
        Ok(requeued)
    }

    pub async fn activate(&self, strategy_id: &str) -> Result<Strategy> {
        let mut strategy = self.load(strategy_id).await?;
        self.engine
            .check_rules(strategy.rules.iter().map(|rule| &rule.condition))?;
        strategy.activate();
        self.store.save_strategy(&strategy).await?;
        self.schedule(&strategy, Duration::ZERO).await?;
        info!("Strategy {} activated", strategy.id);
        Ok(strategy)
    }

    pub async fn pause(&self, strategy_id: &str) -> Result<Strategy> {
        let mut strategy = self.load(strategy_id).await?;
        strategy.pause(Some("paused by user".to_string()));
        self.store.save_strategy(&strategy).await?;
        info!("Strategy {} paused", strategy.id);
        Ok(strategy)
    }

    async fn load(&self, strategy_id: &str) -> Result<Strategy> {
        self.store
            .find_strategy(strategy_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("strategy {}", strategy_id)))
    }
}

#[async_trait]
impl JobHandler for StrategyScheduler {
    fn job_type(&self) -> JobType {
        JobType::ExecuteStrategy
    }

    async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        let payload: StrategyJob = job.payload()?;
        match self.engine.execute(&payload.strategy_id).await? {
            Some(strategy) if strategy.is_active() => {
                Ok(JobOutcome::Reschedule(strategy.frequency.interval()))
            }
            _ => Ok(JobOutcome::Completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_operators() {
        let t = dec!(100);
        assert!(compare(ComparisonOperator::GreaterThan, dec!(101), None, t));
        assert!(!compare(ComparisonOperator::GreaterThan, dec!(100), None, t));
        assert!(compare(ComparisonOperator::LessEqual, dec!(100), None, t));
        assert!(compare(ComparisonOperator::EqualTo, dec!(100.005), None, t));
        assert!(!compare(ComparisonOperator::EqualTo, dec!(100.02), None, t));
    }

    #[test]
    fn test_crosses_need_previous_value() {
        let t = dec!(100);
        assert!(!compare(ComparisonOperator::CrossesAbove, dec!(105), None, t));
        assert!(compare(ComparisonOperator::CrossesAbove, dec!(105), Some(dec!(99)), t));
        assert!(!compare(ComparisonOperator::CrossesAbove, dec!(105), Some(dec!(101)), t));
        assert!(compare(ComparisonOperator::CrossesBelow, dec!(95), Some(dec!(100)), t));
        assert!(!compare(ComparisonOperator::CrossesBelow, dec!(100), Some(dec!(101)), t));
    }

    #[test]
    fn test_price_confidence_bounds() {
        assert_eq!(price_confidence(dec!(100), dec!(100)), 0.5);
        assert!((price_confidence(dec!(102), dec!(100)) - 0.7).abs() < 1e-9);
        assert_eq!(price_confidence(dec!(200), dec!(100)), 1.0);
    }

    #[tokio::test]
    async fn test_snapshot_indicators() {
        let indicators = SnapshotIndicators::new();
        let condition = RuleCondition {
            indicator: IndicatorType::Rsi,
            operator: ComparisonOperator::CrossesBelow,
            value: dec!(30),
            symbol: "aapl".to_string(),
            timeframe: "1h".to_string(),
        };

        let err = indicators.evaluate(&condition, dec!(150)).await.unwrap_err();
        assert!(matches!(err, EngineError::Indicator(_)));

        indicators.push("AAPL", "1h", IndicatorType::Rsi, dec!(35));
        assert!(!indicators.evaluate(&condition, dec!(150)).await.unwrap());

        indicators.push("AAPL", "1h", IndicatorType::Rsi, dec!(28));
        assert!(indicators.evaluate(&condition, dec!(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_price_only_indicators() {
        let indicators = PriceOnlyIndicators;
        assert!(indicators.supports(IndicatorType::Price));
        assert!(!indicators.supports(IndicatorType::Rsi));
        assert!(!indicators.supports(IndicatorType::Volume));

        let condition = RuleCondition {
            indicator: IndicatorType::Macd,
            operator: ComparisonOperator::GreaterThan,
            value: dec!(0),
            symbol: "AAPL".to_string(),
            timeframe: "1d".to_string(),
        };
        let err = indicators.evaluate(&condition, dec!(150)).await.unwrap_err();
        assert!(matches!(err, EngineError::Indicator(_)));
        assert!(SnapshotIndicators::new().supports(IndicatorType::Macd));
    }
}
