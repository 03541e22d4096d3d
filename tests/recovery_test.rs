mod common;

use axum::http::{Method, StatusCode};
use common::{json_body, TestApp};
use engage_vouchers::entities::OrderStatus;
use engage_vouchers::services::recovery::MAX_RECOVERY_ATTEMPTS;
use serde_json::json;
use uuid::Uuid;
use wiremock::ResponseTemplate;

#[tokio::test]
async fn manual_retry_places_the_order_and_charges_the_balance() {
    let app = TestApp::new().await;
    app.mount_token().await;
    app.mount_create_order(ResponseTemplate::new(200).set_body_json(json!({
        "orderId": "AM-RETRY-1",
        "orderStatus": "Pending"
    })))
    .await;

    let product = app.seed_product("ZARA-30", 3_000).await;
    app.seed_balance(app.user_id, 5_000).await;
    let order = app.seed_failed_order(&product, app.user_id, 0).await;

    let uri = format!("/api/v1/vouchers/orders/{}/retry", order.id);
    let (status, body) = json_body(app.request_as_user(Method::POST, &uri, None).await).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Order recovery initiated");
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["recovery_info"]["attempts"], 1);

    let stored = app.order(order.id).await;
    assert_eq!(stored.status, OrderStatus::Confirmed);
    assert_eq!(stored.balance_amount_used, 3_000);
    assert!(stored.last_error.is_none());
    assert_eq!(app.balance(app.user_id).await, 2_000);
}

#[tokio::test]
async fn retry_is_refused_for_settled_or_foreign_orders() {
    let app = TestApp::new().await;
    let product = app.seed_product("ZARA-30", 3_000).await;

    let exhausted = app
        .seed_failed_order(&product, app.user_id, MAX_RECOVERY_ATTEMPTS)
        .await;
    let uri = format!("/api/v1/vouchers/orders/{}/retry", exhausted.id);
    let response = app.request_as_user(Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let foreign = app.seed_failed_order(&product, Uuid::new_v4(), 0).await;
    let uri = format!("/api/v1/vouchers/orders/{}/retry", foreign.id);
    let response = app.request_as_user(Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sweep_cancels_orders_once_attempts_run_out() {
    let app = TestApp::new().await;
    app.mount_token().await;
    app.mount_create_order(ResponseTemplate::new(503).set_body_string("maintenance"))
        .await;

    let product = app.seed_product("ZARA-30", 3_000).await;
    app.seed_balance(app.user_id, 10_000).await;
    let last_chance = app
        .seed_failed_order(&product, app.user_id, MAX_RECOVERY_ATTEMPTS - 1)
        .await;
    let fresh = app.seed_failed_order(&product, app.user_id, 0).await;

    let summary = app.state.services.recovery.recover_all().await.unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.recovered, 0);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        summary.processed,
        summary.recovered + summary.failed + summary.cancelled
    );

    let cancelled = app.order(last_chance.id).await;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.recovery_attempts, MAX_RECOVERY_ATTEMPTS);

    let retried = app.order(fresh.id).await;
    assert_eq!(retried.status, OrderStatus::Error);
    assert_eq!(retried.recovery_attempts, 1);
    assert!(retried.last_error.as_deref().unwrap().contains("maintenance"));

    assert_eq!(app.balance(app.user_id).await, 10_000);
}
