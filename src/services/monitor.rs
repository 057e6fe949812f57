//! Pending order monitor.
//!
//! One `monitor_order` job per pending trade. Each run re-reads the trade,
//! fetches a fresh price and either fills, cancels, or polls again later.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::services::execution;
use crate::services::ledger::LedgerService;
use crate::services::notify::NotificationOutbox;
use crate::services::price::PriceOracle;
use crate::services::queue::JobQueue;
use crate::services::store::Store;
use crate::services::trading::TradingService;
use crate::services::worker::{JobHandler, JobOutcome};
use crate::types::{Job, JobType, MonitorJob, RiskAlert, TradeStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PendingOrderMonitor {
    store: Arc<dyn Store>,
    oracle: Arc<dyn PriceOracle>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<LedgerService>,
    trading: Arc<TradingService>,
    outbox: NotificationOutbox,
    config: EngineConfig,
}

impl PendingOrderMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn PriceOracle>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<LedgerService>,
        trading: Arc<TradingService>,
        outbox: NotificationOutbox,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            queue,
            ledger,
            trading,
            outbox,
            config,
        }
    }

    /// Evaluate one pending trade.
    pub async fn check_trade(&self, trade_id: &str) -> Result<JobOutcome> {
        let Some(trade) = self.store.find_trade_by_id(trade_id).await? else {
            debug!("Trade {} no longer exists, dropping monitor job", trade_id);
            return Ok(JobOutcome::Completed);
        };
        if trade.status != TradeStatus::Pending {
            debug!("Trade {} is already {}, dropping monitor job", trade_id, trade.status);
            return Ok(JobOutcome::Completed);
        }

        let current_price = self.oracle.get_live_price(&trade.symbol).await?;

        let Some(fill_price) = execution::evaluate_trigger(&trade, current_price) else {
            debug!(
                "Trade {} ({} {}) not triggered at {}",
                trade.id, trade.source, trade.symbol, current_price
            );
            return Ok(JobOutcome::Reschedule(self.config.monitor_poll));
        };

        match self.ledger.fill(&trade, fill_price).await {
            Ok((_, executed)) => {
                info!(
                    "Pending {} trade {} triggered at {}, filled at {}",
                    executed.source, executed.id, current_price, fill_price
                );
                self.outbox.trade_executed(&executed);
                Ok(JobOutcome::Completed)
            }
            Err(EngineError::TradeFinalized(msg)) => {
                debug!("Trade {} finalized concurrently: {}", trade.id, msg);
                Ok(JobOutcome::Completed)
            }
            Err(e) if e.is_rejection() => {
                let mut cancelled = trade.clone();
                cancelled.mark_cancelled(e.to_string())?;

                match self.store.cancel_trade(&cancelled).await {
                    Ok(()) => {
                        info!("Cancelled trade {}: {}", trade.id, e);
                        self.outbox.risk_alert(
                            &trade.user_id,
                            RiskAlert::order_cancelled(
                                &trade.id,
                                format!(
                                    "{} {} {} cancelled at fill time: {}",
                                    trade.action, trade.quantity, trade.symbol, e
                                ),
                            ),
                        );
                    }
                    Err(EngineError::TradeFinalized(_)) => {
                        debug!("Trade {} finalized before cancel", trade.id);
                    }
                    Err(other) => return Err(other),
                }
                Ok(JobOutcome::Completed)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-enqueue a monitor job for every pending trade that has none.
    ///
    /// Recovers trades whose jobs exhausted their retries or were never
    /// enqueued.
    pub async fn requeue_stranded(&self) -> Result<usize> {
        let mut requeued = 0;
        for trade in self.store.find_pending_trades().await? {
            if self.queue.has_live_job(&MonitorJob::job_id(&trade.id)).await? {
                continue;
            }
            self.trading.enqueue_monitor(&trade).await?;
            requeued += 1;
        }

        if requeued > 0 {
            warn!("Re-enqueued monitor jobs for {} stranded trades", requeued);
        }
        Ok(requeued)
    }
}

#[async_trait]
impl JobHandler for PendingOrderMonitor {
    fn job_type(&self) -> JobType {
        JobType::MonitorOrder
    }

    async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        let payload: MonitorJob = job.payload()?;
        self.check_trade(&payload.trade_id).await
    }
}
