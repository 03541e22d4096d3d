//! Fixtures shared by the service unit tests.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AmilonConfig;
use crate::db::{establish_connection, run_migrations};
use crate::entities::{credit_balance, order, product, OrderStatus, PaymentMethod};
use crate::events::EventSender;

pub async fn memory_db() -> DatabaseConnection {
    let db = establish_connection("sqlite::memory:").await.unwrap();
    run_migrations(&db).await.unwrap();
    db
}

pub fn events() -> EventSender {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    EventSender::new(tx)
}

pub fn amilon_config(server_uri: &str) -> AmilonConfig {
    AmilonConfig {
        api_url: server_uri.to_string(),
        token_url: format!("{server_uri}/connect/token"),
        client_id: "client".into(),
        client_secret: "secret".into(),
        username: "engage".into(),
        password: "pw".into(),
        contract_id: "contract-1".into(),
        ..Default::default()
    }
}

pub async fn insert_product(db: &DatabaseConnection, code: &str, net_price: i64) -> product::Model {
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
    .insert(db)
    .await
    .unwrap()
}

pub async fn seed_balance(db: &DatabaseConnection, user_id: Uuid, amount: i64) {
    credit_balance::ActiveModel {
        id: Set(Uuid::new_v4()),
        owner_id: Set(user_id),
        credit_type: Set(credit_balance::CASH.to_string()),
        balance: Set(amount),
        created_at: Set(Utc::now()),
        updated_at: Set(None),
    }
    .insert(db)
    .await
    .unwrap();
}

/// An order left in `status` after a failed vendor call.
pub async fn insert_order(
    db: &DatabaseConnection,
    product: &product::Model,
    user_id: Uuid,
    status: OrderStatus,
    recovery_attempts: i32,
) -> order::Model {
    let now = Utc::now();
    order::ActiveModel {
        id: Set(Uuid::new_v4()),
        external_order_id: Set(format!("ENGAGE-TEST-{}", Uuid::new_v4().simple())),
        user_id: Set(Some(user_id)),
        product_id: Set(Some(product.id)),
        amount: Set(product.net_price),
        total_amount: Set(Some(product.net_price)),
        status: Set(status),
        payment_method: Set(Some(PaymentMethod::Balance)),
        balance_amount_used: Set(0),
        currency: Set("EUR".into()),
        recovery_attempts: Set(recovery_attempts),
        last_error: Set(Some("Amilon order error: boom".into())),
        created_at: Set(now),
        updated_at: Set(Some(now)),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}
