//! Order submission, pending order monitoring and fill-time behavior.

mod common;

use common::Harness;
use reckon::error::EngineError;
use reckon::services::{JobQueue, JobOutcome, RecordingNotifier, Store};
use reckon::types::{
    JobState, MonitorJob, Notification, OrderAction, OrderSource, RiskAlertKind, TradeRequest,
    TradeStatus, MAX_QUANTITY,
};
use rust_decimal_macros::dec;

fn buy(quantity: rust_decimal::Decimal) -> TradeRequest {
    TradeRequest::market("alice", "aapl", OrderAction::Buy, quantity)
}

fn sell(quantity: rust_decimal::Decimal) -> TradeRequest {
    TradeRequest::market("alice", "AAPL", OrderAction::Sell, quantity)
}

#[tokio::test]
async fn test_market_buy_debits_notional_and_fees() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let trade = h.state.trading.submit(buy(dec!(10))).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Executed);
    assert_eq!(trade.symbol, "AAPL");
    assert_eq!(trade.price, Some(dec!(150)));
    assert_eq!(trade.fees, dec!(1.5));
    assert_eq!(trade.total, dec!(1501.5));
    assert_eq!(trade.market_data.unwrap().close, dec!(150));
    // One quote serves both the fill price and the snapshot.
    assert_eq!(h.oracle.calls(), 1);

    let portfolio = h.portfolio("alice").await;
    assert_eq!(portfolio.cash, dec!(98498.5));
    let position = portfolio.position("AAPL").unwrap();
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.avg_buy_price, dec!(150));

    // Market orders never leave a monitor job behind.
    assert_eq!(h.queue.live_count(), 0);

    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    match &notes[0] {
        Notification::TradeExecuted { user_id, summary } => {
            assert_eq!(user_id, "alice");
            assert_eq!(summary.trade_id, trade.id);
            assert_eq!(summary.source, "market");
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_sell_more_than_held_is_rejected() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));
    h.state.trading.submit(buy(dec!(3))).await.unwrap();
    let before = h.portfolio("alice").await;

    let err = h.state.trading.submit(sell(dec!(5))).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientHoldings { .. }));

    let after = h.portfolio("alice").await;
    assert_eq!(after.cash, before.cash);
    assert_eq!(after.holding("AAPL"), dec!(3));

    let trades = h.state.trading.list_trades("alice", 10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].action, OrderAction::Buy);
}

#[tokio::test]
async fn test_sell_realizes_pnl_against_average_cost() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(100));
    h.state.trading.submit(buy(dec!(10))).await.unwrap();
    h.set_price("AAPL", dec!(120));
    h.state.trading.submit(buy(dec!(10))).await.unwrap();

    h.set_price("AAPL", dec!(130));
    let trade = h.state.trading.submit(sell(dec!(5))).await.unwrap();

    // Average cost 110, so 5 * (130 - 110) = 100 before fees.
    assert_eq!(trade.fees, dec!(0.65));
    assert_eq!(trade.realized_pnl, Some(dec!(99.35)));

    let portfolio = h.portfolio("alice").await;
    let position = portfolio.position("AAPL").unwrap();
    assert_eq!(position.quantity, dec!(15));
    assert_eq!(position.avg_buy_price, dec!(110));
    assert_eq!(position.total_invested, dec!(1650));
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_pricing() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let err = h.state.trading.submit(buy(dec!(0))).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = h
        .state
        .trading
        .submit(buy(dec!(1)).with_source(OrderSource::StopLoss {
            stop_price: dec!(140),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn test_oversized_orders_are_rejected_without_side_effects() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let huge = rust_decimal::Decimal::from_i128_with_scale(10i128.pow(27), 0);
    let err = h.state.trading.submit(buy(huge)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Within the quantity bound but the notional at this quote is unrepresentable.
    h.set_price("AAPL", rust_decimal::Decimal::from_i128_with_scale(10i128.pow(25), 0));
    let err = h.state.trading.submit(buy(MAX_QUANTITY)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(h.state.trading.list_trades("alice", 10).await.unwrap().is_empty());
    assert!(h.store.find_portfolio_by_user("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn test_limit_buy_fills_at_limit_price() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(145));

    let request = buy(dec!(10)).with_source(OrderSource::Limit {
        limit_price: dec!(140),
    });
    let trade = h.state.trading.submit(request).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Pending);
    assert_eq!(trade.trigger_price, dec!(145));
    assert!(h.queue.has_live_job(&MonitorJob::job_id(&trade.id)).await.unwrap());

    // Untriggered at 145: polled again later.
    assert_eq!(h.run_monitor().await, 1);
    let stored = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(stored.status, TradeStatus::Pending);

    h.set_price("AAPL", dec!(138));
    assert_eq!(h.tick_monitor().await, 1);

    let filled = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(filled.status, TradeStatus::Executed);
    assert_eq!(filled.price, Some(dec!(140)));
    assert_eq!(filled.fees, dec!(1.4));
    assert!(filled.executed_at.is_some());

    let portfolio = h.portfolio("alice").await;
    assert_eq!(portfolio.cash, dec!(98598.6));
    assert_eq!(portfolio.position("AAPL").unwrap().avg_buy_price, dec!(140));
    assert_eq!(h.queue.live_count(), 0);
}

#[tokio::test]
async fn test_stop_loss_waits_above_stop() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(160));
    h.state.trading.submit(buy(dec!(10))).await.unwrap();

    let request = sell(dec!(10)).with_source(OrderSource::StopLoss {
        stop_price: dec!(145),
    });
    let trade = h.state.trading.submit(request).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Pending);

    h.set_price("AAPL", dec!(150));
    let outcome = h.state.monitor.check_trade(&trade.id).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Reschedule(_)));
    let stored = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(stored.status, TradeStatus::Pending);

    // Stop fills at the market, not at the stop.
    h.set_price("AAPL", dec!(143));
    h.tick_monitor().await;
    let filled = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(filled.status, TradeStatus::Executed);
    assert_eq!(filled.price, Some(dec!(143)));
    assert_eq!(h.portfolio("alice").await.holding("AAPL"), dec!(0));
}

#[tokio::test]
async fn test_take_profit_fills_at_market_above_target() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(100));
    h.state.trading.submit(buy(dec!(4))).await.unwrap();

    let request = sell(dec!(4)).with_source(OrderSource::TakeProfit {
        stop_price: dec!(120),
    });
    let trade = h.state.trading.submit(request).await.unwrap();

    h.set_price("AAPL", dec!(125));
    h.tick_monitor().await;

    let filled = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(filled.status, TradeStatus::Executed);
    assert_eq!(filled.price, Some(dec!(125)));
    assert_eq!(filled.realized_pnl, Some(dec!(99.5)));
}

#[tokio::test]
async fn test_pending_sell_fails_fast_without_holdings() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let request = sell(dec!(1)).with_source(OrderSource::Limit {
        limit_price: dec!(160),
    });
    let err = h.state.trading.submit(request).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientHoldings { .. }));

    assert!(h.state.trading.list_trades("alice", 10).await.unwrap().is_empty());
    assert_eq!(h.queue.live_count(), 0);
}

#[tokio::test]
async fn test_monitor_is_idempotent() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));
    let request = buy(dec!(10)).with_source(OrderSource::Limit {
        limit_price: dec!(150),
    });
    let trade = h.state.trading.submit(request).await.unwrap();

    // Re-enqueueing a live job is a no-op.
    let id = h.state.trading.enqueue_monitor(&trade).await.unwrap();
    assert_eq!(id, MonitorJob::job_id(&trade.id));
    assert_eq!(h.queue.live_count(), 1);

    assert_eq!(h.run_monitor().await, 1);
    let cash = h.portfolio("alice").await.cash;
    assert_eq!(cash, dec!(98498.5));

    // A redelivered job sees the executed trade and does nothing.
    let outcome = h.state.monitor.check_trade(&trade.id).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(h.portfolio("alice").await.cash, cash);

    // So does a job for a trade that never existed.
    let outcome = h.state.monitor.check_trade("missing").await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let executed = h
        .notifications()
        .await
        .into_iter()
        .filter(|n| matches!(n, Notification::TradeExecuted { .. }))
        .count();
    assert_eq!(executed, 1);
}

#[tokio::test]
async fn test_fill_time_shortfall_cancels_with_alert() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(145));

    // Not checked for cash at submission.
    let request = buy(dec!(1000)).with_source(OrderSource::Limit {
        limit_price: dec!(140),
    });
    let trade = h.state.trading.submit(request).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Pending);

    h.set_price("AAPL", dec!(138));
    h.run_monitor().await;

    let cancelled = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(cancelled.status, TradeStatus::Cancelled);
    assert!(cancelled.error_message.unwrap().contains("Insufficient cash"));
    assert!(cancelled.price.is_none());

    let portfolio = h.portfolio("alice").await;
    assert_eq!(portfolio.cash, dec!(100000));
    assert!(portfolio.positions.is_empty());
    assert_eq!(h.queue.live_count(), 0);

    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    match &notes[0] {
        Notification::RiskAlert { user_id, alert } => {
            assert_eq!(user_id, "alice");
            assert_eq!(alert.kind, RiskAlertKind::OrderCancelled);
            assert_eq!(alert.trade_id.as_deref(), Some(trade.id.as_str()));
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_price_outage_retries_then_sweep_recovers() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(145));
    let request = buy(dec!(10)).with_source(OrderSource::Limit {
        limit_price: dec!(140),
    });
    let trade = h.state.trading.submit(request).await.unwrap();
    let job_id = MonitorJob::job_id(&trade.id);

    h.oracle.remove("AAPL");
    h.run_monitor().await;
    let job = h.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 1);
    assert!(job.last_error.unwrap().contains("AAPL"));

    // Three attempts in the test config.
    h.tick_monitor().await;
    h.tick_monitor().await;
    let job = h.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(!h.queue.has_live_job(&job_id).await.unwrap());

    // The trade outlives its job.
    let stored = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(stored.status, TradeStatus::Pending);

    assert_eq!(h.state.monitor.requeue_stranded().await.unwrap(), 1);
    assert_eq!(h.state.monitor.requeue_stranded().await.unwrap(), 0);

    h.set_price("AAPL", dec!(139));
    h.run_monitor().await;
    let filled = h.state.trading.get_trade(&trade.id).await.unwrap();
    assert_eq!(filled.status, TradeStatus::Executed);
    assert_eq!(filled.price, Some(dec!(140)));
}

#[tokio::test]
async fn test_price_unavailable_at_submission_persists_nothing() {
    let h = Harness::new();

    let err = h.state.trading.submit(buy(dec!(1))).await.unwrap_err();
    assert!(matches!(err, EngineError::PriceUnavailable(_)));
    assert!(err.is_transient());
    assert!(h.state.trading.list_trades("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_notifier_failure_does_not_affect_trade() {
    let h = Harness::with_notifier(RecordingNotifier::failing());
    h.set_price("AAPL", dec!(150));

    let trade = h.state.trading.submit(buy(dec!(2))).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Executed);
    assert!(h.notifications().await.is_empty());

    let stored = h.store.find_trade_by_id(&trade.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Executed);
    assert_eq!(h.portfolio("alice").await.holding("AAPL"), dec!(2));
}
