use async_trait::async_trait;
use chrono::{Datelike, Utc};
use reqwest::Method;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{AmilonClient, VoucherOrderGateway, API_VERSION, PROVIDER};
use crate::dto::{OrderDto, OrderStatusSummary};
use crate::entities::{order, order_item, product, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{
    Notification, NotificationHub, VoucherErrorCode, VoucherNotificationStatus,
};

/// Voucher info collected while attaching vouchers to order items.
struct ReceivedVouchers {
    product_name: String,
    product_code: String,
    voucher_count: usize,
}

/// Places and refreshes voucher orders with Amilon and keeps the local copy in sync.
pub struct AmilonOrderService {
    client: AmilonClient,
    db: Arc<DatabaseConnection>,
    notifications: NotificationHub,
    events: EventSender,
}

impl AmilonOrderService {
    pub fn new(
        client: AmilonClient,
        db: Arc<DatabaseConnection>,
        notifications: NotificationHub,
        events: EventSender,
    ) -> Self {
        Self {
            client,
            db,
            notifications,
            events,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    pub fn api_version(&self) -> &'static str {
        API_VERSION
    }

    pub async fn is_healthy(&self) -> bool {
        self.client.is_healthy().await
    }

    /// `ENGAGE-{year}-{uuid}`
    pub fn generate_external_order_id() -> String {
        format!("ENGAGE-{}-{}", Utc::now().year(), Uuid::new_v4())
    }

    /// Places an order for `quantity` codes of `product` under `external_order_id`.
    #[instrument(skip(self, product, payment_id), fields(product_id = %product.id))]
    pub async fn create_order(
        &self,
        product: &product::Model,
        quantity: i32,
        external_order_id: &str,
        user_id: Option<Uuid>,
        payment_id: Option<String>,
    ) -> Result<OrderDto, ServiceError> {
        let result = self
            .try_create_order(
                product,
                quantity,
                external_order_id,
                user_id,
                payment_id.as_deref(),
            )
            .await;

        if let Err(e) = &result {
            error!(
                error = %e,
                product_code = ?product.product_code,
                quantity,
                external_order_id,
                payment_id = ?payment_id,
                "Exception while creating Amilon order"
            );
            if let Some(user_id) = user_id {
                self.notifications.publish(Notification::purchase_error(
                    user_id,
                    VoucherErrorCode::AmilonOrderFailed,
                    format!("Failed to create order with Amilon: {e}"),
                    json!({
                        "product_code": product.product_code,
                        "external_order_id": external_order_id,
                    }),
                ));
            }
        }

        result
    }

    async fn try_create_order(
        &self,
        product: &product::Model,
        quantity: i32,
        external_order_id: &str,
        user_id: Option<Uuid>,
        payment_id: Option<&str>,
    ) -> Result<OrderDto, ServiceError> {
        let product_code = product
            .product_code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| ServiceError::AmilonOrder("Product code is required".into()))?;

        let payload = json!({
            "externalOrderId": external_order_id,
            "orderRows": [{ "productId": product_code, "quantity": quantity }],
        });
        let path = format!("/Orders/create/{}", self.client.config().contract_id);

        let response = self
            .client
            .send_authorized(Method::POST, &path, Some(&payload))
            .await?;

        if !response.status.is_success() {
            error!(
                status = response.status.as_u16(),
                body = %response.body,
                payload = %payload,
                "Failed to create Amilon order"
            );
            return Err(ServiceError::AmilonOrder(format!(
                "Failed to create Amilon order: {}",
                response.body
            )));
        }

        let dto = OrderDto::from_api_response(
            &response.json(),
            product,
            product.net_price,
            external_order_id,
            payment_id,
        );

        let stored = dto.clone();
        let order = self
            .db
            .transaction::<_, order::Model, ServiceError>(|txn| {
                Box::pin(async move { upsert_order(txn, &stored, user_id).await })
            })
            .await?;

        info!(
            order_id = %order.id,
            amilon_order_id = ?order.order_id,
            external_order_id,
            "Amilon order created"
        );

        self.events
            .send_or_log(Event::VoucherOrderCreated {
                order_id: order.id,
                user_id,
                external_order_id: order.external_order_id.clone(),
            })
            .await;

        if let Some(user_id) = user_id {
            self.notifications.publish(Notification::purchase(
                user_id,
                order.id,
                VoucherNotificationStatus::AmilonOrderCreated,
                json!({
                    "external_order_id": order.external_order_id,
                    "amilon_order_id": order.order_id,
                    "product_name": product.name,
                    "quantity": quantity,
                    "status": order.status,
                }),
                "Your voucher order has been submitted to Amilon",
            ));
        }

        Ok(dto)
    }

    /// Pulls the complete order from Amilon and refreshes status and vouchers locally.
    #[instrument(skip(self))]
    pub async fn get_order_info(&self, external_order_id: &str) -> Result<OrderDto, ServiceError> {
        let result = self.try_get_order_info(external_order_id).await;
        if let Err(e) = &result {
            error!(error = %e, external_order_id, "Exception while getting Amilon order info");
        }
        result
    }

    async fn try_get_order_info(&self, external_order_id: &str) -> Result<OrderDto, ServiceError> {
        let path = format!("/Orders/{external_order_id}/complete");
        let response = self.client.send_authorized(Method::GET, &path, None).await?;

        if !response.status.is_success() {
            error!(
                status = response.status.as_u16(),
                body = %response.body,
                external_order_id,
                "Failed to get Amilon order info"
            );
            return Err(ServiceError::AmilonOrder(format!(
                "Failed to get order info: {}",
                response.body
            )));
        }

        let data = response.json();
        let external_order_id = external_order_id.to_string();
        let (order, items, received) = self
            .db
            .transaction::<_, _, ServiceError>(|txn| {
                Box::pin(async move { refresh_order(txn, &external_order_id, &data).await })
            })
            .await?;

        if !received.is_empty() {
            if let Some(user_id) = order.user_id {
                let vouchers: Vec<Value> = received
                    .iter()
                    .map(|r| {
                        json!({
                            "product_name": r.product_name,
                            "product_code": r.product_code,
                            "voucher_count": r.voucher_count,
                        })
                    })
                    .collect();
                self.notifications.publish(Notification::purchase(
                    user_id,
                    order.id,
                    VoucherNotificationStatus::VouchersReceived,
                    json!({
                        "external_order_id": order.external_order_id,
                        "amilon_order_id": order.order_id,
                        "vouchers": vouchers,
                    }),
                    "Your vouchers have been received and are ready to use",
                ));
            }
        }

        Ok(OrderDto::from_model(&order, &items))
    }

    /// Status and first voucher of the order Amilon knows as `amilon_order_id`.
    pub async fn get_order_status(
        &self,
        amilon_order_id: &str,
    ) -> Result<OrderStatusSummary, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::OrderId.eq(amilon_order_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order not found with Amilon ID: {amilon_order_id}"))
            })?;

        let info = self.get_order_info(&order.external_order_id).await?;
        let (voucher_code, voucher_url) = info.first_voucher().unwrap_or((None, None));

        Ok(OrderStatusSummary {
            status: info.status.unwrap_or_else(|| "unknown".to_string()),
            voucher_code,
            voucher_url,
            expires_at: None,
        })
    }

    /// Places an order from a payment webhook payload
    /// `{user_id, product_id, voucher_amount, payment_intent_id}`.
    pub async fn create_from_webhook_data(&self, data: &Value) -> Result<OrderDto, ServiceError> {
        let product_id = data
            .get("product_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                ServiceError::ValidationError("Product ID is required in webhook data".into())
            })?;

        let product = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product not found: {product_id}")))?;

        let quantity = match data.get("voucher_amount") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .and_then(|q| i32::try_from(q).ok())
        .filter(|q| *q > 0)
        .ok_or_else(|| ServiceError::ValidationError("Invalid voucher amount".into()))?;

        let user_id = data
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());
        let payment_id = data
            .get("payment_intent_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let external_order_id = Self::generate_external_order_id();
        self.create_order(&product, quantity, &external_order_id, user_id, payment_id)
            .await
    }
}

#[async_trait]
impl VoucherOrderGateway for AmilonOrderService {
    async fn create_order(
        &self,
        product: &product::Model,
        quantity: i32,
        external_order_id: &str,
        user_id: Option<Uuid>,
        payment_id: Option<String>,
    ) -> Result<OrderDto, ServiceError> {
        AmilonOrderService::create_order(
            self,
            product,
            quantity,
            external_order_id,
            user_id,
            payment_id,
        )
        .await
    }

    async fn get_order_info(&self, external_order_id: &str) -> Result<OrderDto, ServiceError> {
        AmilonOrderService::get_order_info(self, external_order_id).await
    }
}

/// Writes `dto` onto the order with the same external id, creating it when absent.
///
/// An existing row keeps its status; callers drive the state machine.
pub async fn upsert_order<C: ConnectionTrait>(
    conn: &C,
    dto: &OrderDto,
    user_id: Option<Uuid>,
) -> Result<order::Model, ServiceError> {
    let now = Utc::now();
    let existing = order::Entity::find()
        .filter(order::Column::ExternalOrderId.eq(dto.external_order_id.as_str()))
        .one(conn)
        .await?;
    let is_new = existing.is_none();

    let mut active: order::ActiveModel = match existing {
        Some(model) => model.into(),
        None => order::ActiveModel {
            id: Set(Uuid::new_v4()),
            external_order_id: Set(dto.external_order_id.clone()),
            status: Set(OrderStatus::from_amilon_status(dto.status.as_deref())),
            balance_amount_used: Set(0),
            recovery_attempts: Set(0),
            created_at: Set(now),
            ..Default::default()
        },
    };

    active.amount = Set(dto.amount);
    active.total_amount = Set(Some(dto.amount));
    active.currency = Set(dto.currency.clone());
    active.updated_at = Set(Some(now));
    if let Some(user_id) = user_id {
        active.user_id = Set(Some(user_id));
    }
    if dto.product_id.is_some() {
        active.product_id = Set(dto.product_id);
    }
    if dto.merchant_id.is_some() {
        active.merchant_id = Set(dto.merchant_id);
    }
    if dto.price_paid.is_some() {
        active.price_paid = Set(dto.price_paid);
    }
    if dto.order_id.is_some() {
        active.order_id = Set(dto.order_id.clone());
    }
    if dto.order_status.is_some() {
        active.order_status = Set(dto.order_status.clone());
    }
    if dto.payment_id.is_some() {
        active.payment_id = Set(dto.payment_id.clone());
    }
    if dto.product_name.is_some() {
        active.product_name = Set(dto.product_name.clone());
    }
    if dto.voucher_code.is_some() {
        active.voucher_code = Set(dto.voucher_code.clone());
    }
    if dto.voucher_pin.is_some() {
        active.voucher_pin = Set(dto.voucher_pin.clone());
    }
    if dto.voucher_url.is_some() {
        active.voucher_url = Set(dto.voucher_url.clone());
    }
    if dto.order_date.is_some() {
        active.order_date = Set(dto.order_date);
    }
    if dto.gross_amount.is_some() {
        active.gross_amount = Set(dto.gross_amount);
    }
    if dto.net_amount.is_some() {
        active.net_amount = Set(dto.net_amount);
    }
    if dto.total_requested_codes.is_some() {
        active.total_requested_codes = Set(dto.total_requested_codes);
    }

    let order = if is_new {
        active.insert(conn).await?
    } else {
        active.update(conn).await?
    };

    let codes: Vec<String> = dto
        .items
        .iter()
        .map(|item| item.product_id.clone())
        .filter(|code| !code.is_empty())
        .collect();
    let products = product_ids_by_code(conn, &codes).await?;
    let current_items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(conn)
        .await?;

    for item in &dto.items {
        let vouchers = (!item.vouchers.is_empty()).then(|| Value::Array(item.vouchers.clone()));
        let matching = current_items
            .iter()
            .find(|row| row.product_code.as_deref() == Some(item.product_id.as_str()));

        match matching {
            Some(row) => {
                let mut row: order_item::ActiveModel = row.clone().into();
                row.quantity = Set(item.quantity);
                if vouchers.is_some() {
                    row.vouchers = Set(vouchers);
                }
                row.updated_at = Set(Some(now));
                row.update(conn).await?;
            }
            None => {
                order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    product_id: Set(products.get(&item.product_id).copied()),
                    product_code: Set(Some(item.product_id.clone())),
                    quantity: Set(item.quantity),
                    price: Set(dto.price_paid),
                    vouchers: Set(vouchers),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(conn)
                .await?;
            }
        }
    }

    Ok(order)
}

async fn refresh_order<C: ConnectionTrait>(
    conn: &C,
    external_order_id: &str,
    data: &Value,
) -> Result<(order::Model, Vec<order_item::Model>, Vec<ReceivedVouchers>), ServiceError> {
    let order = order::Entity::find()
        .filter(order::Column::ExternalOrderId.eq(external_order_id))
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Order not found with external ID: {external_order_id}"
            ))
        })?;

    let raw_status = data
        .get("orderStatus")
        .or_else(|| data.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let mapped = OrderStatus::from_amilon_status(raw_status.as_deref());
    // Only pending orders follow the vendor; recovery owns `error`.
    let status = if order.status == OrderStatus::Pending {
        mapped
    } else {
        if mapped != order.status {
            warn!(
                order_id = %order.id,
                current = %order.status,
                reported = %mapped,
                "Keeping local status over the one reported by Amilon"
            );
        }
        order.status
    };

    let mut active: order::ActiveModel = order.into();
    active.status = Set(status);
    active.order_status = Set(raw_status);
    active.updated_at = Set(Some(Utc::now()));
    let order = active.update(conn).await?;

    let received = attach_vouchers(conn, &order, data).await?;
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(conn)
        .await?;

    Ok((order, items, received))
}

/// Copies `orderRows[].vouchers` onto the order items of the same product.
async fn attach_vouchers<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    data: &Value,
) -> Result<Vec<ReceivedVouchers>, ServiceError> {
    let Some(rows) = data.get("orderRows").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let by_code: Vec<(String, Vec<Value>)> = rows
        .iter()
        .filter_map(|row| {
            let code = row.get("productId").and_then(Value::as_str)?;
            let vouchers = row
                .get("vouchers")
                .or_else(|| row.get("Vouchers"))
                .and_then(Value::as_array)?;
            Some((code.to_string(), vouchers.clone()))
        })
        .collect();
    if by_code.is_empty() {
        return Ok(Vec::new());
    }

    let codes: Vec<String> = by_code.iter().map(|(code, _)| code.clone()).collect();
    let products: HashMap<String, product::Model> = product::Entity::find()
        .filter(product::Column::ProductCode.is_in(codes))
        .all(conn)
        .await?
        .into_iter()
        .filter_map(|p| p.product_code.clone().map(|code| (code, p)))
        .collect();

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(conn)
        .await?;

    let now = Utc::now();
    let mut received = Vec::new();
    for (code, vouchers) in by_code {
        let Some(product) = products.get(&code) else {
            continue;
        };
        let Some(item) = items.iter().find(|item| {
            item.product_id == Some(product.id) || item.product_code.as_deref() == Some(&code)
        }) else {
            continue;
        };

        let voucher_count = vouchers.len();
        let mut active: order_item::ActiveModel = item.clone().into();
        active.vouchers = Set(Some(Value::Array(vouchers)));
        active.updated_at = Set(Some(now));
        active.update(conn).await?;

        received.push(ReceivedVouchers {
            product_name: product.name.clone(),
            product_code: code,
            voucher_count,
        });
    }

    Ok(received)
}

async fn product_ids_by_code<C: ConnectionTrait>(
    conn: &C,
    codes: &[String],
) -> Result<HashMap<String, Uuid>, DbErr> {
    if codes.is_empty() {
        return Ok(HashMap::new());
    }
    let products = product::Entity::find()
        .filter(product::Column::ProductCode.is_in(codes.iter().cloned()))
        .all(conn)
        .await?;
    Ok(products
        .into_iter()
        .filter_map(|p| p.product_code.map(|code| (code, p.id)))
        .collect())
}
