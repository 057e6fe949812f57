//! Persistence seam for trades, portfolios and strategies.

use crate::error::Result;
use crate::types::{Portfolio, Strategy, Trade};
use async_trait::async_trait;

/// Document store used by the engine.
///
/// Every method is atomic for the document it touches. `commit_fill` is the
/// one cross-document write: the portfolio and the trade land together or not
/// at all.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_trade_by_id(&self, id: &str) -> Result<Option<Trade>>;

    /// Insert or fully overwrite a trade.
    async fn save_trade(&self, trade: &Trade) -> Result<()>;

    async fn find_pending_trades(&self) -> Result<Vec<Trade>>;

    /// Most recent first.
    async fn find_trades_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>>;

    async fn find_portfolio_by_user(&self, user_id: &str) -> Result<Option<Portfolio>>;

    /// Write a portfolio only if the stored version still equals
    /// `portfolio.version`. Returns the portfolio with its bumped version, or
    /// `VersionConflict`. Version 0 inserts a portfolio that is not stored yet.
    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<Portfolio>;

    /// Persist a fill: the portfolio (optimistic version check) and the
    /// executed trade in one transaction. An existing trade is only
    /// overwritten while it is still pending; otherwise `TradeFinalized`.
    async fn commit_fill(&self, portfolio: &Portfolio, trade: &Trade) -> Result<Portfolio>;

    /// Write a cancelled trade, only if the stored trade is still pending.
    async fn cancel_trade(&self, trade: &Trade) -> Result<()>;

    async fn find_strategy(&self, id: &str) -> Result<Option<Strategy>>;

    async fn find_active_strategies(&self) -> Result<Vec<Strategy>>;

    async fn save_strategy(&self, strategy: &Strategy) -> Result<()>;
}
