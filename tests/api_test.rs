//! HTTP surface: routes, envelopes and error mapping.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::Harness;
use reckon::api;
use reckon::services::Store;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    api::app(h.state.clone())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (status, body) = send(app(&h), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"], "memory");
    assert_eq!(body["pendingTrades"], 0);
}

#[tokio::test]
async fn test_submit_market_trade() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "aapl",
                "action": "BUY",
                "quantity": "10",
                "source": "market"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "executed");
    assert_eq!(body["data"]["symbol"], "AAPL");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(app(&h), get(&format!("/api/trades/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id.as_str());

    let (status, body) = send(app(&h), get("/api/users/carol/trades?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(app(&h), get("/api/portfolios/carol")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.portfolio("carol").await.cash, dec!(98498.5));
}

#[tokio::test]
async fn test_submit_limit_trade_is_pending() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(145));

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "AAPL",
                "action": "BUY",
                "quantity": "10",
                "source": "limit",
                "limitPrice": "140"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["source"], "limit");
    assert_eq!(h.queue.live_count(), 1);
}

#[tokio::test]
async fn test_error_mapping() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let (status, body) = send(app(&h), get("/api/trades/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "AAPL",
                "action": "SELL",
                "quantity": "1",
                "source": "market"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INSUFFICIENT_HOLDINGS");

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "AAPL",
                "action": "BUY",
                "quantity": "-1",
                "source": "market"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "NOQUOTE",
                "action": "BUY",
                "quantity": "1",
                "source": "market"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "PRICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_oversized_quantity_is_a_validation_error() {
    let h = Harness::new();
    h.set_price("AAPL", dec!(150));

    let (status, body) = send(
        app(&h),
        post(
            "/api/trades",
            json!({
                "userId": "carol",
                "symbol": "AAPL",
                "action": "BUY",
                "quantity": "1000000000000000000000000000",
                "source": "market"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
    assert!(h.store.find_portfolio_by_user("carol").await.unwrap().is_none());
}

#[tokio::test]
async fn test_portfolio_of_unknown_user_is_not_stored() {
    let h = Harness::new();

    let (status, body) = send(app(&h), get("/api/portfolios/ghost")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["userId"], "ghost");
    assert_eq!(body["data"]["cash"], "100000");
    assert!(body["data"]["positions"].as_array().unwrap().is_empty());
    assert!(h.store.find_portfolio_by_user("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_strategy_lifecycle() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        post(
            "/api/strategies",
            json!({
                "userId": "carol",
                "name": "rsi dip",
                "frequency": "1h",
                "rules": [{
                    "name": "oversold",
                    "condition": {
                        "indicator": "rsi",
                        "operator": "less_than",
                        "value": "30",
                        "symbol": "aapl"
                    },
                    "action": { "type": "BUY", "quantity": "5" },
                    "cooldownMinutes": 60
                }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "paused");
    assert_eq!(body["data"]["rules"][0]["condition"]["symbol"], "AAPL");
    assert_eq!(body["data"]["rules"][0]["condition"]["timeframe"], "1d");
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(h.queue.live_count(), 0);

    let (status, body) = send(
        app(&h),
        post(&format!("/api/strategies/{}/activate", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");
    assert_eq!(h.queue.live_count(), 1);

    let (status, body) = send(
        app(&h),
        post(&format!("/api/strategies/{}/pause", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "paused");

    let (status, body) = send(app(&h), get(&format!("/api/strategies/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "rsi dip");

    let (status, _) = send(app(&h), post("/api/strategies/missing/activate", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_strategy_without_rules_is_rejected() {
    let h = Harness::new();
    let (status, body) = send(
        app(&h),
        post(
            "/api/strategies",
            json!({ "userId": "carol", "name": "empty", "rules": [] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn test_indicator_rules_need_an_indicator_feed() {
    let h = Harness::price_only();
    let strategy = |indicator: &str| {
        json!({
            "userId": "carol",
            "name": "dip",
            "rules": [{
                "condition": {
                    "indicator": indicator,
                    "operator": "less_than",
                    "value": "30",
                    "symbol": "AAPL"
                },
                "action": { "type": "BUY", "quantity": "1" }
            }]
        })
    };

    let (status, body) = send(app(&h), post("/api/strategies", strategy("rsi"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");

    let (status, _) = send(app(&h), post("/api/strategies", strategy("price"))).await;
    assert_eq!(status, StatusCode::CREATED);
}
