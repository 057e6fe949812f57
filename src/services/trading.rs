//! Trade submission.
//!
//! Entry point for every order, whether it comes from the API or from a
//! strategy rule.

use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::services::execution;
use crate::services::ledger::LedgerService;
use crate::services::notify::NotificationOutbox;
use crate::services::price::PriceOracle;
use crate::services::queue::JobQueue;
use crate::services::store::Store;
use crate::types::{
    JobOptions, JobType, MonitorJob, OrderAction, Portfolio, Trade, TradeRequest,
};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct TradingService {
    store: Arc<dyn Store>,
    oracle: Arc<dyn PriceOracle>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<LedgerService>,
    outbox: NotificationOutbox,
    queue_config: QueueConfig,
}

impl TradingService {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn PriceOracle>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<LedgerService>,
        outbox: NotificationOutbox,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            queue,
            ledger,
            outbox,
            queue_config,
        }
    }

    /// Submit an order.
    ///
    /// Market orders fill now or are rejected with nothing persisted.
    /// Deferred orders are stored as pending and handed to the monitor.
    pub async fn submit(&self, mut request: TradeRequest) -> Result<Trade> {
        request.validate()?;

        let quote = self.oracle.get_quote(&request.symbol).await?;
        let price = quote.price;
        debug!("Submitting {} {} at live {}", request.action, request.symbol, price);

        let decision = execution::decide(&request.source, price);
        let trade = Trade::from_request(&request, price, Some(quote.market_data))?;
        trade.validate()?;

        if decision.execute {
            let fill_price = decision.execution_price.unwrap_or(price);
            let (_, executed) = self.ledger.fill(&trade, fill_price).await?;
            self.outbox.trade_executed(&executed);
            return Ok(executed);
        }

        if trade.action == OrderAction::Sell {
            self.ledger
                .ensure_holdings(&trade.user_id, &trade.symbol, trade.quantity)
                .await?;
        }

        self.store.save_trade(&trade).await?;
        info!(
            "Accepted {} {} {} {} for {} as pending (trade {})",
            trade.source, trade.action, trade.quantity, trade.symbol, trade.user_id, trade.id
        );

        // A failed enqueue leaves the trade pending; the stranded sweep picks it up.
        if let Err(e) = self.enqueue_monitor(&trade).await {
            error!("Failed to enqueue monitor for trade {}: {}", trade.id, e);
        }

        Ok(trade)
    }

    /// Queue the monitor job for a pending trade.
    pub async fn enqueue_monitor(&self, trade: &Trade) -> Result<String> {
        let payload = serde_json::to_value(MonitorJob::from(trade))?;
        let opts = JobOptions::with_id(MonitorJob::job_id(&trade.id))
            .attempts(self.queue_config.max_attempts);
        self.queue.enqueue(JobType::MonitorOrder, payload, opts).await
    }

    pub async fn get_trade(&self, id: &str) -> Result<Trade> {
        self.store
            .find_trade_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", id)))
    }

    pub async fn list_trades(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>> {
        self.store.find_trades_by_user(user_id, limit).await
    }

    pub async fn portfolio(&self, user_id: &str) -> Result<Portfolio> {
        self.ledger.portfolio(user_id).await
    }
}
