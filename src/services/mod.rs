pub mod execution;
pub mod ledger;
pub mod monitor;
pub mod notify;
pub mod price;
pub mod queue;
pub mod redis_queue;
pub mod sqlite_store;
pub mod store;
pub mod strategy;
pub mod trading;
pub mod worker;

pub use ledger::LedgerService;
pub use monitor::PendingOrderMonitor;
pub use notify::{LogNotifier, NotificationOutbox, Notifier, RecordingNotifier, WebhookNotifier};
pub use price::{HttpPriceOracle, LiveQuote, PriceOracle, QuoteCache, StaticPriceOracle};
pub use queue::{JobQueue, MemoryJobQueue};
pub use redis_queue::RedisJobQueue;
pub use sqlite_store::SqliteStore;
pub use store::Store;
pub use strategy::{
    IndicatorEvaluator, PriceOnlyIndicators, SnapshotIndicators, StrategyEngine, StrategyRun,
    StrategyScheduler,
};
pub use trading::TradingService;
pub use worker::{JobHandler, JobOutcome, Worker};
