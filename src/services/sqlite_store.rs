//! SQLite persistence layer for trades, portfolios and strategies.
//!
//! Each record is stored as a JSON document next to the columns the engine
//! queries on. Portfolios carry a version column used for optimistic writes.

use crate::error::{EngineError, Result};
use crate::services::store::Store;
use crate::types::{Portfolio, Strategy, Trade, TradeStatus};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite store for engine state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Persistence("sqlite connection lock poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);

            CREATE TABLE IF NOT EXISTS portfolios (
                user_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status);",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

// ========== Trade Helpers ==========

const UPSERT_TRADE: &str = "INSERT INTO trades (id, user_id, symbol, status, created_at, updated_at, doc)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(id) DO UPDATE SET
        status = excluded.status,
        updated_at = excluded.updated_at,
        doc = excluded.doc";

/// Insert a trade, or overwrite it only while the stored row is pending.
const UPSERT_PENDING_TRADE: &str = "INSERT INTO trades (id, user_id, symbol, status, created_at, updated_at, doc)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(id) DO UPDATE SET
        status = excluded.status,
        updated_at = excluded.updated_at,
        doc = excluded.doc
     WHERE trades.status = 'pending'";

fn write_trade(conn: &Connection, sql: &str, trade: &Trade) -> Result<usize> {
    let doc = serde_json::to_string(trade)?;
    Ok(conn.execute(
        sql,
        params![
            trade.id,
            trade.user_id,
            trade.symbol,
            trade.status.as_str(),
            trade.created_at,
            trade.updated_at,
            doc
        ],
    )?)
}

fn trade_status(conn: &Connection, id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT status FROM trades WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

fn finalized(id: &str, status: &str) -> EngineError {
    EngineError::TradeFinalized(format!("trade {} is already {}", id, status))
}

// ========== Portfolio Helpers ==========

fn read_portfolio(conn: &Connection, user_id: &str) -> Result<Option<Portfolio>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, doc FROM portfolios WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((version, doc)) => {
            let mut portfolio: Portfolio = decode(&doc)?;
            portfolio.version = version as u64;
            Ok(Some(portfolio))
        }
        None => Ok(None),
    }
}

/// Versioned write. Version 0 means "not stored yet".
fn write_portfolio(conn: &Connection, portfolio: &Portfolio) -> Result<Portfolio> {
    let mut next = portfolio.clone();
    next.version = portfolio.version + 1;
    let doc = serde_json::to_string(&next)?;

    let changed = conn.execute(
        "UPDATE portfolios SET version = ?2, updated_at = ?3, doc = ?4
         WHERE user_id = ?1 AND version = ?5",
        params![
            next.user_id,
            next.version as i64,
            next.updated_at,
            doc,
            portfolio.version as i64
        ],
    )?;
    if changed == 1 {
        return Ok(next);
    }

    if portfolio.version == 0 {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO portfolios (user_id, version, updated_at, doc)
             VALUES (?1, ?2, ?3, ?4)",
            params![next.user_id, next.version as i64, next.updated_at, doc],
        )?;
        if inserted == 1 {
            return Ok(next);
        }
    }

    Err(EngineError::VersionConflict(format!(
        "portfolio for {} changed since version {}",
        portfolio.user_id, portfolio.version
    )))
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_trade_by_id(&self, id: &str) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM trades WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        doc.map(|d| decode(&d)).transpose()
    }

    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn()?;
        write_trade(&conn, UPSERT_TRADE, trade)?;
        Ok(())
    }

    async fn find_pending_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM trades WHERE status = 'pending' ORDER BY created_at ASC",
        )?;
        let docs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn find_trades_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM trades WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let docs = stmt
            .query_map(params![user_id, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn find_portfolio_by_user(&self, user_id: &str) -> Result<Option<Portfolio>> {
        let conn = self.conn()?;
        read_portfolio(&conn, user_id)
    }

    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<Portfolio> {
        let conn = self.conn()?;
        write_portfolio(&conn, portfolio)
    }

    async fn commit_fill(&self, portfolio: &Portfolio, trade: &Trade) -> Result<Portfolio> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if write_trade(&tx, UPSERT_PENDING_TRADE, trade)? == 0 {
            let status = trade_status(&tx, &trade.id)?.unwrap_or_default();
            return Err(finalized(&trade.id, &status));
        }
        let saved = write_portfolio(&tx, portfolio)?;

        tx.commit()?;
        debug!(
            "Committed fill of trade {} (portfolio {} v{})",
            trade.id, saved.user_id, saved.version
        );
        Ok(saved)
    }

    async fn cancel_trade(&self, trade: &Trade) -> Result<()> {
        if trade.status != TradeStatus::Cancelled {
            return Err(EngineError::Validation(format!(
                "trade {} is not cancelled",
                trade.id
            )));
        }

        let conn = self.conn()?;
        let doc = serde_json::to_string(trade)?;
        let changed = conn.execute(
            "UPDATE trades SET status = ?2, updated_at = ?3, doc = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![trade.id, trade.status.as_str(), trade.updated_at, doc],
        )?;

        if changed == 0 {
            return match trade_status(&conn, &trade.id)? {
                Some(status) => Err(finalized(&trade.id, &status)),
                None => Err(EngineError::NotFound(format!("trade {}", trade.id))),
            };
        }
        Ok(())
    }

    async fn find_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM strategies WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| decode(&d)).transpose()
    }

    async fn find_active_strategies(&self) -> Result<Vec<Strategy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT doc FROM strategies WHERE status = 'active'")?;
        let docs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn save_strategy(&self, strategy: &Strategy) -> Result<()> {
        let conn = self.conn()?;
        let doc = serde_json::to_string(strategy)?;
        conn.execute(
            "INSERT INTO strategies (id, user_id, status, updated_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                doc = excluded.doc",
            params![
                strategy.id,
                strategy.user_id,
                strategy.status.to_string(),
                strategy.updated_at,
                doc
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionFrequency, OrderAction, OrderSource, TradeRequest};
    use rust_decimal_macros::dec;

    fn pending_trade() -> Trade {
        let request = TradeRequest::market("user-1", "AAPL", OrderAction::Buy, dec!(10))
            .with_source(OrderSource::Limit {
                limit_price: dec!(140),
            });
        Trade::from_request(&request, dec!(145), None).unwrap()
    }

    #[tokio::test]
    async fn test_trade_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let trade = pending_trade();
        store.save_trade(&trade).await.unwrap();

        let loaded = store.find_trade_by_id(&trade.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Pending);
        assert_eq!(loaded.source, trade.source);
        assert_eq!(loaded.total, trade.total);

        let pending = store.find_pending_trades().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.find_trade_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_portfolio_version_conflict() {
        let store = SqliteStore::new_in_memory().unwrap();
        let portfolio = store
            .save_portfolio(&Portfolio::new("user-1", dec!(1000)))
            .await
            .unwrap();
        assert_eq!(portfolio.version, 1);

        let mut first = portfolio.clone();
        first.cash = dec!(900);
        let saved = store.save_portfolio(&first).await.unwrap();
        assert_eq!(saved.version, 2);

        // A writer holding the stale version loses.
        let mut stale = portfolio;
        stale.cash = dec!(800);
        let err = store.save_portfolio(&stale).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict(_)));

        let stored = store.find_portfolio_by_user("user-1").await.unwrap().unwrap();
        assert_eq!(stored.cash, dec!(900));
    }

    #[tokio::test]
    async fn test_commit_fill_only_transitions_pending() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut trade = pending_trade();
        store.save_trade(&trade).await.unwrap();

        let mut portfolio = store
            .save_portfolio(&Portfolio::new("user-1", dec!(100000)))
            .await
            .unwrap();
        portfolio
            .apply_buy("AAPL", dec!(10), dec!(140), dec!(1.4))
            .unwrap();
        trade.mark_executed(dec!(140), None).unwrap();

        let saved = store.commit_fill(&portfolio, &trade).await.unwrap();
        assert_eq!(saved.version, portfolio.version + 1);

        // Second commit of the same trade is rejected and leaves the ledger alone.
        let mut again = saved.clone();
        again.cash -= dec!(1401.4);
        let err = store.commit_fill(&again, &trade).await.unwrap_err();
        assert!(matches!(err, EngineError::TradeFinalized(_)));

        let stored = store.find_portfolio_by_user("user-1").await.unwrap().unwrap();
        assert_eq!(stored.cash, dec!(98598.6));
        assert_eq!(stored.version, saved.version);
    }

    #[tokio::test]
    async fn test_commit_fill_rolls_back_on_conflict() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut trade = pending_trade();
        store.save_trade(&trade).await.unwrap();

        let mut stale = store
            .save_portfolio(&Portfolio::new("user-1", dec!(100000)))
            .await
            .unwrap();
        store.save_portfolio(&stale).await.unwrap();

        stale.cash = dec!(1);
        trade.mark_executed(dec!(140), None).unwrap();
        let err = store.commit_fill(&stale, &trade).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict(_)));

        let loaded = store.find_trade_by_id(&trade.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_is_pending_only() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut trade = pending_trade();
        store.save_trade(&trade).await.unwrap();

        trade.mark_cancelled("insufficient cash").unwrap();
        store.cancel_trade(&trade).await.unwrap();

        let err = store.cancel_trade(&trade).await.unwrap_err();
        assert!(matches!(err, EngineError::TradeFinalized(_)));
    }

    #[tokio::test]
    async fn test_active_strategies() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut active = Strategy::new("user-1", "a", ExecutionFrequency::OneMinute);
        active.activate();
        let paused = Strategy::new("user-1", "b", ExecutionFrequency::OneMinute);
        store.save_strategy(&active).await.unwrap();
        store.save_strategy(&paused).await.unwrap();

        let found = store.find_active_strategies().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);
    }
}
