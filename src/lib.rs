//! Reckon - order lifecycle and execution engine for paper trading portfolios

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod types;

use config::Config;
use services::{
    IndicatorEvaluator, JobQueue, LedgerService, NotificationOutbox, PendingOrderMonitor,
    PriceOracle, Store, StrategyEngine, StrategyScheduler, TradingService,
};
use std::sync::Arc;

/// Application state shared across handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<LedgerService>,
    pub trading: Arc<TradingService>,
    pub monitor: Arc<PendingOrderMonitor>,
    pub strategies: Arc<StrategyEngine>,
    pub scheduler: Arc<StrategyScheduler>,
    pub outbox: NotificationOutbox,
}

impl AppState {
    /// Wire the engine services around the given collaborators.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        oracle: Arc<dyn PriceOracle>,
        indicators: Arc<dyn IndicatorEvaluator>,
        outbox: NotificationOutbox,
    ) -> Self {
        let ledger = Arc::new(LedgerService::new(store.clone(), config.engine.clone()));

        let trading = Arc::new(TradingService::new(
            store.clone(),
            oracle.clone(),
            queue.clone(),
            ledger.clone(),
            outbox.clone(),
            config.queue.clone(),
        ));

        let monitor = Arc::new(PendingOrderMonitor::new(
            store.clone(),
            oracle.clone(),
            queue.clone(),
            ledger.clone(),
            trading.clone(),
            outbox.clone(),
            config.engine.clone(),
        ));

        let strategies = Arc::new(StrategyEngine::new(
            store.clone(),
            oracle,
            trading.clone(),
            indicators,
            outbox.clone(),
            config.strategy.clone(),
        ));

        let scheduler = Arc::new(StrategyScheduler::new(
            strategies.clone(),
            store.clone(),
            queue.clone(),
            config.queue.max_attempts,
        ));

        Self {
            config: Arc::new(config),
            store,
            queue,
            ledger,
            trading,
            monitor,
            strategies,
            scheduler,
            outbox,
        }
    }
}
