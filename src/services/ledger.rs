//! Portfolio ledger.
//!
//! The only writer of portfolios. Fills for one user are serialized by an
//! in-process mutex; the store's version check catches writers in other
//! processes, and the fill is retried from a fresh read when that happens.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::services::store::Store;
use crate::types::{fee_for, notional, OrderAction, Portfolio, Trade};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub struct LedgerService {
    store: Arc<dyn Store>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            config,
        }
    }

    /// Hold the per-user ledger lock.
    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the user's lock entry once nobody holds or awaits it.
    fn release_user(&self, user_id: &str) {
        self.locks.remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Users with a lock entry.
    pub fn tracked_users(&self) -> usize {
        self.locks.len()
    }

    /// The user's portfolio, or an unsaved one with the default cash.
    ///
    /// Never writes; the first fill stores the portfolio.
    pub async fn portfolio(&self, user_id: &str) -> Result<Portfolio> {
        Ok(self
            .store
            .find_portfolio_by_user(user_id)
            .await?
            .unwrap_or_else(|| Portfolio::new(user_id, self.config.default_cash)))
    }

    /// Fail fast when a SELL is not covered by current holdings.
    pub async fn ensure_holdings(&self, user_id: &str, symbol: &str, quantity: Decimal) -> Result<()> {
        self.portfolio(user_id)
            .await?
            .ensure_holdings(symbol, quantity)
    }

    /// Execute a trade at `price`.
    ///
    /// Validates against the current portfolio, applies the mutation and
    /// commits portfolio and executed trade together. Returns the committed
    /// portfolio and trade. Nothing is written when validation fails.
    pub async fn fill(&self, trade: &Trade, price: Decimal) -> Result<(Portfolio, Trade)> {
        let guard = self.lock_user(&trade.user_id).await;
        let result = self.fill_locked(trade, price).await;
        drop(guard);
        self.release_user(&trade.user_id);
        result
    }

    async fn fill_locked(&self, trade: &Trade, price: Decimal) -> Result<(Portfolio, Trade)> {
        let attempts = self.config.ledger_retries.max(1);

        for attempt in 1..=attempts {
            let mut portfolio = self.portfolio(&trade.user_id).await?;
            let executed = apply_fill(&mut portfolio, trade, price)?;

            match self.store.commit_fill(&portfolio, &executed).await {
                Ok(saved) => {
                    info!(
                        "Executed {} {} {} @ {} for {} (trade {})",
                        executed.action,
                        executed.quantity,
                        executed.symbol,
                        price,
                        executed.user_id,
                        executed.id
                    );
                    debug!("Cash for {} now {}", saved.user_id, saved.cash);
                    return Ok((saved, executed));
                }
                Err(EngineError::VersionConflict(msg)) if attempt < attempts => {
                    warn!("Ledger write for {} lost a race ({}), retrying", trade.user_id, msg);
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::VersionConflict(format!(
            "portfolio for {} kept changing",
            trade.user_id
        )))
    }
}

/// Apply a fill to an in-memory portfolio and return the executed trade.
pub fn apply_fill(portfolio: &mut Portfolio, trade: &Trade, price: Decimal) -> Result<Trade> {
    let fees = fee_for(notional(trade.quantity, price)?);

    let realized_pnl = match trade.action {
        OrderAction::Buy => {
            portfolio.apply_buy(&trade.symbol, trade.quantity, price, fees)?;
            None
        }
        OrderAction::Sell => Some(portfolio.apply_sell(&trade.symbol, trade.quantity, price, fees)?),
    };

    let mut executed = trade.clone();
    executed.mark_executed(price, realized_pnl)?;
    executed.validate()?;
    Ok(executed)
}
