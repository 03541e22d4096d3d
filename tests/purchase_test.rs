mod common;

use axum::http::{Method, StatusCode};
use common::{json_body, TestApp};
use engage_vouchers::entities::OrderStatus;
use serde_json::json;
use uuid::Uuid;
use wiremock::ResponseTemplate;

#[tokio::test]
async fn balance_purchase_debits_and_confirms_the_order() {
    let app = TestApp::new().await;
    app.mount_token().await;
    app.mount_create_order(ResponseTemplate::new(200).set_body_json(json!({
        "orderId": "AM-100",
        "orderStatus": "Pending",
        "orderRows": [{"productId": "FNAC-25", "quantity": 1}]
    })))
    .await;

    let product = app.seed_product("FNAC-25", 2_500).await;
    app.seed_balance(app.user_id, 10_000).await;

    let response = app
        .request_as_user(
            Method::POST,
            "/api/v1/vouchers/purchase",
            Some(json!({"product_id": product.id, "payment_method": "balance"})),
        )
        .await;
    let (status, body) = json_body(response).await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["amount_paid"], 2_500);
    assert_eq!(body["remaining_balance"], 7_500);
    assert_eq!(body["amilon_order"]["order_id"], "AM-100");

    let order_id: Uuid = serde_json::from_value(body["order_id"].clone()).unwrap();
    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.balance_amount_used, 2_500);
    assert_eq!(order.order_id.as_deref(), Some("AM-100"));
    assert_eq!(app.balance(app.user_id).await, 7_500);
}

#[tokio::test]
async fn insufficient_balance_is_rejected_before_contacting_amilon() {
    let app = TestApp::new().await;
    app.mount_token().await;
    app.mount_create_order(ResponseTemplate::new(200).set_body_json(json!({"orderId": "never"})))
        .await;

    let product = app.seed_product("FNAC-25", 2_500).await;
    app.seed_balance(app.user_id, 1_000).await;

    let response = app
        .request_as_user(
            Method::POST,
            "/api/v1/vouchers/purchase",
            Some(json!({"product_id": product.id, "payment_method": "balance"})),
        )
        .await;
    let (status, body) = json_body(response).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Insufficient balance"));
    assert_eq!(app.balance(app.user_id).await, 1_000);

    let vendor_calls = app
        .amilon
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().contains("/Orders/create"))
        .count();
    assert_eq!(vendor_calls, 0);
}

#[tokio::test]
async fn vendor_failure_restores_the_balance() {
    let app = TestApp::new().await;
    app.mount_token().await;
    app.mount_create_order(ResponseTemplate::new(500).set_body_string("contract suspended"))
        .await;

    let product = app.seed_product("FNAC-25", 2_500).await;
    app.seed_balance(app.user_id, 10_000).await;

    let response = app
        .request_as_user(
            Method::POST,
            "/api/v1/vouchers/purchase",
            Some(json!({"product_id": product.id, "payment_method": "balance"})),
        )
        .await;
    let (status, _body) = json_body(response).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.balance(app.user_id).await, 10_000);

    let failed = app
        .state
        .services
        .recovery
        .identify_failed_orders()
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].balance_amount_used, 0);
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("contract suspended"));
}

#[tokio::test]
async fn stripe_purchases_are_not_handled_here() {
    let app = TestApp::new().await;
    let product = app.seed_product("FNAC-25", 2_500).await;

    let response = app
        .request_as_user(
            Method::POST,
            "/api/v1/vouchers/purchase",
            Some(json!({"product_id": product.id, "payment_method": "stripe"})),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn purchase_requires_identity() {
    let app = TestApp::new().await;
    let product = app.seed_product("FNAC-25", 2_500).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/vouchers/purchase",
            Some(json!({"product_id": product.id, "payment_method": "balance"})),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
