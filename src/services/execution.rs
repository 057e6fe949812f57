//! Execution decision.
//!
//! Pure functions: no I/O, no clock. Submission uses `decide`; the pending
//! order monitor uses `evaluate_trigger` with a freshly fetched price.

use crate::types::{ExecutionDecision, OrderSource, Trade, TradeStatus};
use rust_decimal::Decimal;

/// Decide whether a submitted order fills now.
///
/// Market orders always fill at the current price. Every deferred source is
/// left pending even if its trigger already holds, so triggers are only ever
/// evaluated by the monitor.
pub fn decide(source: &OrderSource, current_price: Decimal) -> ExecutionDecision {
    match source {
        OrderSource::Market => ExecutionDecision {
            execute: true,
            execution_price: Some(current_price),
            status: TradeStatus::Executed,
        },
        OrderSource::Limit { .. } | OrderSource::StopLoss { .. } | OrderSource::TakeProfit { .. } => {
            ExecutionDecision {
                execute: false,
                execution_price: None,
                status: TradeStatus::Pending,
            }
        }
    }
}

/// Fill price for a pending trade at `current_price`, if its trigger fired.
pub fn evaluate_trigger(trade: &Trade, current_price: Decimal) -> Option<Decimal> {
    trade.source.trigger(trade.action, current_price)
}
