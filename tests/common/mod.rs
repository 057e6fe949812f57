//! Shared wiring for integration tests: in-memory store, in-process queue,
//! static prices and a recording notifier.

#![allow(dead_code)]

use reckon::config::Config;
use reckon::services::{
    IndicatorEvaluator, MemoryJobQueue, NotificationOutbox, PriceOnlyIndicators,
    RecordingNotifier, SnapshotIndicators, SqliteStore, StaticPriceOracle, Worker,
};
use reckon::types::{Notification, Portfolio};
use reckon::AppState;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub state: AppState,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub oracle: Arc<StaticPriceOracle>,
    pub indicators: Arc<SnapshotIndicators>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    // Retries only become due through `advance_all`.
    config.queue.backoff_base = Duration::from_secs(60);
    config.queue.max_attempts = 3;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::build(config, Arc::new(RecordingNotifier::new()), false)
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        Self::build(test_config(), Arc::new(notifier), false)
    }

    /// Engine wired the way the binary runs it: price rules only.
    pub fn price_only() -> Self {
        Self::build(test_config(), Arc::new(RecordingNotifier::new()), true)
    }

    fn build(config: Config, notifier: Arc<RecordingNotifier>, price_only: bool) -> Self {
        let store = Arc::new(SqliteStore::new_in_memory().expect("in-memory store"));
        let queue = Arc::new(MemoryJobQueue::new(config.queue.backoff_base));
        let oracle = Arc::new(StaticPriceOracle::new());
        let indicators = Arc::new(SnapshotIndicators::new());
        let evaluator: Arc<dyn IndicatorEvaluator> = if price_only {
            Arc::new(PriceOnlyIndicators)
        } else {
            indicators.clone()
        };
        let (outbox, _task) = NotificationOutbox::spawn(notifier.clone());

        let state = AppState::new(
            config,
            store.clone(),
            queue.clone(),
            oracle.clone(),
            evaluator,
            outbox,
        );

        Self {
            state,
            store,
            queue,
            oracle,
            indicators,
            notifier,
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.oracle.set_price(symbol, price);
    }

    /// Process every monitor job that is due now.
    pub async fn run_monitor(&self) -> usize {
        let worker = Worker::new(
            self.state.queue.clone(),
            self.state.monitor.clone(),
            self.state.config.queue.clone(),
        );
        worker.drain().await.expect("drain monitor jobs")
    }

    /// Process every strategy job that is due now.
    pub async fn run_strategies(&self) -> usize {
        let worker = Worker::new(
            self.state.queue.clone(),
            self.state.scheduler.clone(),
            self.state.config.queue.clone(),
        );
        worker.drain().await.expect("drain strategy jobs")
    }

    /// Make every delayed job due, then process monitor jobs.
    pub async fn tick_monitor(&self) -> usize {
        self.queue.advance_all();
        self.run_monitor().await
    }

    pub async fn portfolio(&self, user_id: &str) -> Portfolio {
        self.state
            .trading
            .portfolio(user_id)
            .await
            .expect("load portfolio")
    }

    /// Notifications delivered so far.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.outbox.flush().await;
        self.notifier.sent()
    }
}
