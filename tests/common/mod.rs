#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use engage_vouchers::{
    config::{AmilonConfig, AppConfig, StripeConfig},
    db,
    entities::{credit_balance, order, product, stripe_payment, OrderStatus, PaymentMethod, PaymentStatus},
    events::{self, EventSender},
    notifications::NotificationHub,
    AppState,
};
use hmac::{Hmac, Mac};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const CONTRACT_ID: &str = "contract-1";

/// Application wired against in-memory SQLite with Amilon played by a wiremock server.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub amilon: MockServer,
    pub user_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let amilon = MockServer::start().await;

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.amilon = AmilonConfig {
            api_url: amilon.uri(),
            token_url: format!("{}/connect/token", amilon.uri()),
            client_id: "client".into(),
            client_secret: "secret".into(),
            username: "engage".into(),
            password: "pw".into(),
            contract_id: CONTRACT_ID.into(),
            ..Default::default()
        };
        cfg.stripe = StripeConfig {
            webhook_secret: Some(WEBHOOK_SECRET.into()),
            webhook_secret_cli: None,
            webhook_tolerance_secs: None,
        };

        let pool = db::establish_connection(&cfg.database_url)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(
            Arc::new(pool),
            cfg,
            EventSender::new(event_tx),
            NotificationHub::new(64),
        );
        let router = engage_vouchers::app(state.clone());

        Self {
            router,
            state,
            amilon,
            user_id: Uuid::new_v4(),
            _event_task: event_task,
        }
    }

    pub async fn mount_token(&self) {
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 300})),
            )
            .mount(&self.amilon)
            .await;
    }

    pub async fn mount_create_order(&self, template: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(format!("/b2bwebapi/v1/Orders/create/{CONTRACT_ID}")))
            .respond_with(template)
            .mount(&self.amilon)
            .await;
    }

    /// Send a request as `user` (no identity headers when `None`).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header("x-user-id", user_id.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// Request as the default test user.
    pub async fn request_as_user(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        self.request(method, uri, body, Some(self.user_id)).await
    }

    pub async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn post_webhook(&self, payload: &str, signature: &str) -> axum::response::Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/stripe/webhook")
            .header("content-type", "application/json")
            .header("stripe-signature", signature)
            .body(Body::from(payload.to_string()))
            .expect("failed to build webhook request");
        self.send(request).await
    }

    pub async fn seed_product(&self, code: &str, net_price: i64) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_code: Set(Some(code.to_string())),
            merchant_id: Set(None),
            name: Set(format!("Voucher {code}")),
            price: Set(net_price),
            net_price: Set(net_price),
            currency: Set("EUR".into()),
            is_available: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_balance(&self, user_id: Uuid, amount: i64) {
        credit_balance::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(user_id),
            credit_type: Set(credit_balance::CASH.to_string()),
            balance: Set(amount),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed balance");
    }

    pub async fn balance(&self, user_id: Uuid) -> i64 {
        credit_balance::Entity::find()
            .filter(credit_balance::Column::OwnerId.eq(user_id))
            .filter(credit_balance::Column::CreditType.eq(credit_balance::CASH))
            .one(&*self.state.db)
            .await
            .expect("query balance")
            .map(|row| row.balance)
            .unwrap_or(0)
    }

    /// An order the vendor rejected, with `attempts` recovery attempts used.
    pub async fn seed_failed_order(
        &self,
        product: &product::Model,
        user_id: Uuid,
        attempts: i32,
    ) -> order::Model {
        self.seed_order(product, user_id, OrderStatus::Error, attempts)
            .await
    }

    pub async fn seed_order(
        &self,
        product: &product::Model,
        user_id: Uuid,
        status: OrderStatus,
        attempts: i32,
    ) -> order::Model {
        let now = Utc::now();
        let last_error = (status == OrderStatus::Error)
            .then(|| "Amilon order error: upstream timeout".to_string());
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            external_order_id: Set(format!("ENGAGE-IT-{}", Uuid::new_v4().simple())),
            user_id: Set(Some(user_id)),
            product_id: Set(Some(product.id)),
            amount: Set(product.net_price),
            total_amount: Set(Some(product.price)),
            status: Set(status),
            payment_method: Set(Some(PaymentMethod::Balance)),
            balance_amount_used: Set(0),
            currency: Set("EUR".into()),
            recovery_attempts: Set(attempts),
            last_error: Set(last_error),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed order")
    }

    pub async fn seed_payment(
        &self,
        user_id: Uuid,
        intent: Option<&str>,
        checkout: Option<&str>,
        amount: i64,
    ) -> stripe_payment::Model {
        stripe_payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            stripe_payment_id: Set(intent.map(str::to_string)),
            stripe_checkout_id: Set(checkout.map(str::to_string)),
            status: Set(PaymentStatus::Pending),
            amount: Set(amount),
            currency: Set("EUR".into()),
            credit_amount: Set(amount),
            credit_type: Set(credit_balance::CASH.into()),
            error_message: Set(None),
            metadata: Set(None),
            processed_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed stripe payment")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn json_body(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response body is json")
    };
    (status, value)
}

/// `Stripe-Signature` header for `payload` signed now with `secret`.
pub fn stripe_signature(payload: &str, secret: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
