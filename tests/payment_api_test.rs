//! Integration tests for the /api/payment routes

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{callback_body, harness, Harness};
use quota_topup_backend::api::payments::{routes, PaymentApiState};
use quota_topup_backend::database::memory::InMemoryCreditLedger;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

async fn app() -> (Router, Harness, Arc<InMemoryCreditLedger>) {
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let h = harness(ledger.clone()).await;
    let router = routes(PaymentApiState {
        lifecycle: h.lifecycle.clone(),
    });
    (router, h, ledger)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_post(uri: &str, user_id: Option<i64>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id.to_string());
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str, user_id: i64) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-user-id", user_id.to_string())
        .body(Body::empty())
        .expect("request")
}

fn callback(method: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/payment/callback/{}", method))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .expect("request")
}

#[tokio::test]
async fn create_returns_redirect_and_order_id() {
    let (router, _, _) = app().await;
    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/create",
            Some(42),
            json!({"amount": "10.00", "payment_method": "alipay"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let order_id = body["order_id"].as_str().expect("order id");
    assert!(order_id.starts_with("PAY42"));
    assert_eq!(
        body["url"],
        format!("https://pay.example.com/{}", order_id)
    );
    assert_eq!(body["data"]["amount"], "10.00");
}

#[tokio::test]
async fn create_without_user_is_unauthorized() {
    let (router, _, _) = app().await;
    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/create",
            None,
            json!({"amount": 10, "payment_method": "alipay"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let (router, _, _) = app().await;

    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/create",
            Some(1),
            json!({"amount": 10, "payment_method": "stripe"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "UNSUPPORTED_GATEWAY");

    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/create",
            Some(1),
            json!({"amount": -3, "payment_method": "alipay"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_AMOUNT");

    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/create",
            Some(1),
            json!({"amount": 10, "payment_method": "paypal"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "GATEWAY_NOT_CONFIGURED");
}

#[tokio::test]
async fn amount_preview_applies_discount() {
    let (router, _, _) = app().await;
    let (status, body) = send(
        &router,
        json_post(
            "/api/payment/amount",
            None,
            json!({"amount": 10, "top_up_code": "WELCOME10"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["amount"].is_number());
    assert_eq!(body["amount"], 9.0);
    assert_eq!(body["count"], 4_500_000);
}

#[tokio::test]
async fn callback_settles_order_and_status_is_owner_only() {
    let (router, _, ledger) = app().await;
    let (_, created) = send(
        &router,
        json_post(
            "/api/payment/create",
            Some(42),
            json!({"amount": 2, "payment_method": "wechat"}),
        ),
    )
    .await;
    let order_id = created["order_id"].as_str().expect("order id").to_string();

    let (status, ack) = send(
        &router,
        callback("wechat", callback_body(&order_id, "success", "yes")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, json!({"success": true}));
    assert_eq!(ledger.balance_of(42).await, 1_000_000);

    let (status, body) = send(&router, get(&format!("/api/payment/status/{}", order_id), 42)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "success");
    assert_eq!(body["data"]["quota_amount"], 1_000_000);

    let (status, body) = send(&router, get(&format!("/api/payment/status/{}", order_id), 43)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    let (status, _) = send(&router, get("/api/payment/status/PAY0", 42)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_acks_even_when_not_applied() {
    let (router, _, ledger) = app().await;
    let (status, ack) = send(
        &router,
        callback("alipay", callback_body("PAY404", "success", "yes")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["success"], true);
    assert!(ledger.grants().await.is_empty());
}

#[tokio::test]
async fn unreadable_or_unknown_callbacks_are_refused() {
    let (router, _, _) = app().await;

    let (status, ack) = send(&router, callback("stripe", "x=1".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ack["success"], false);

    let (status, ack) = send(&router, callback("alipay", "status=success".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ack["success"], false);

    let (status, ack) = send(&router, callback("paypal", "invoice=PAY1".to_string())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(ack["success"], false);
}

#[tokio::test]
async fn order_listing_is_paged() {
    let (router, _, _) = app().await;
    for _ in 0..3 {
        send(
            &router,
            json_post(
                "/api/payment/create",
                Some(77),
                json!({"amount": 1, "payment_method": "alipay"}),
            ),
        )
        .await;
    }

    let (status, body) = send(&router, get("/api/payment/orders?page=2&page_size=2", 77)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["page"], 2);
    assert_eq!(body["data"]["page_size"], 2);
    assert_eq!(body["data"]["items"].as_array().expect("items").len(), 1);
}
