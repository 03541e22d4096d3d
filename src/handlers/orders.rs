use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::dto::OrderDto;
use crate::entities::{order, order_item, OrderStatus, PaymentMethod};
use crate::errors::ServiceError;
use crate::services::purchase::{PurchaseVoucherRequest, PurchaseVoucherResponse};
use crate::services::recovery::VoucherRecoveryService;
use crate::{ApiResponse, AppState, PaginatedResponse};

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderListQuery {
    /// Only orders in this status
    pub status: Option<OrderStatus>,
    /// Page number (default: 1)
    pub page: Option<u64>,
    /// Items per page
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecoveryInfo {
    pub attempts: i32,
    pub can_retry: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl RecoveryInfo {
    fn of(order: &order::Model) -> Self {
        Self {
            attempts: order.recovery_attempts,
            can_retry: VoucherRecoveryService::can_retry(order),
            last_error: order.last_error.clone(),
            last_attempt_at: order.last_recovery_attempt,
        }
    }
}

/// A stored voucher order as returned to its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VoucherOrderResponse {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub payment_method: Option<PaymentMethod>,
    pub balance_amount_used: i64,
    #[serde(flatten)]
    pub order: OrderDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_info: Option<RecoveryInfo>,
}

impl VoucherOrderResponse {
    fn new(order: &order::Model, items: &[order_item::Model]) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            payment_method: order.payment_method,
            balance_amount_used: order.balance_amount_used,
            order: OrderDto::from_model(order, items),
            recovery_info: None,
        }
    }

    fn with_recovery_info(mut self, order: &order::Model) -> Self {
        self.recovery_info = Some(RecoveryInfo::of(order));
        self
    }
}

async fn items_by_order(
    state: &AppState,
    order_ids: Vec<Uuid>,
) -> Result<HashMap<Uuid, Vec<order_item::Model>>, ServiceError> {
    if order_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.is_in(order_ids))
        .all(&*state.db)
        .await?;

    let mut grouped: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
    for item in items {
        grouped.entry(item.order_id).or_default().push(item);
    }
    Ok(grouped)
}

async fn render(state: &AppState, order: &order::Model) -> Result<VoucherOrderResponse, ServiceError> {
    let items = items_by_order(state, vec![order.id]).await?;
    Ok(VoucherOrderResponse::new(
        order,
        items.get(&order.id).map(Vec::as_slice).unwrap_or_default(),
    ))
}

/// List the caller's voucher orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/vouchers/orders",
    summary = "List voucher orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<PaginatedResponse<VoucherOrderResponse>>),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<VoucherOrderResponse>>>, ServiceError> {
    let max_per_page = state.config.api_max_page_size.max(1);
    let per_page = query
        .per_page
        .unwrap_or(state.config.api_default_page_size)
        .clamp(1, max_per_page);
    let page = query.page.unwrap_or(1).max(1);

    let mut select = order::Entity::find().filter(order::Column::UserId.eq(user.user_id));
    if let Some(status) = query.status {
        select = select.filter(order::Column::Status.eq(status));
    }

    let paginator = select
        .order_by_desc(order::Column::CreatedAt)
        .paginate(&*state.db, per_page);
    let total = paginator.num_items().await?;
    let orders = paginator.fetch_page(page - 1).await?;

    let mut items = items_by_order(&state, orders.iter().map(|o| o.id).collect()).await?;
    let responses = orders
        .iter()
        .map(|o| VoucherOrderResponse::new(o, &items.remove(&o.id).unwrap_or_default()))
        .collect();

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items: responses,
        total,
        page,
        per_page,
        total_pages: total.div_ceil(per_page),
    })))
}

/// Get one order by id or external order id, refreshed from Amilon when possible
#[utoipa::path(
    get,
    path = "/api/v1/vouchers/orders/{id}",
    summary = "Get voucher order",
    params(("id" = String, Path, description = "Order UUID or external order id")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<VoucherOrderResponse>),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 403, description = "Order belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(identifier): Path<String>,
) -> Result<Json<ApiResponse<VoucherOrderResponse>>, ServiceError> {
    let order = order::find_by_identifier(&*state.db, &identifier)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

    if !user.can_access(order.user_id) {
        return Err(ServiceError::Forbidden(
            "You do not have permission to view this order".to_string(),
        ));
    }

    let order = match state
        .services
        .amilon_orders
        .get_order_info(&order.external_order_id)
        .await
    {
        Ok(_) => order::Entity::find_by_id(order.id)
            .one(&*state.db)
            .await?
            .unwrap_or(order),
        Err(e) => {
            warn!(
                error = %e,
                order_id = %order.id,
                "Error getting order info from Amilon, using stored data"
            );
            order
        }
    };

    let response = render(&state, &order).await?.with_recovery_info(&order);
    Ok(Json(ApiResponse::success(response)))
}

/// Purchase a voucher. Amounts are in cents.
#[utoipa::path(
    post,
    path = "/api/v1/vouchers/purchase",
    summary = "Purchase voucher",
    request_body = PurchaseVoucherRequest,
    responses(
        (status = 201, description = "Voucher purchased with balance", body = PurchaseVoucherResponse),
        (status = 200, description = "Product unavailable, nothing charged", body = PurchaseVoucherResponse),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient balance or unsupported payment method", body = crate::errors::ErrorResponse),
        (status = 502, description = "Amilon rejected the order", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn purchase_voucher(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<PurchaseVoucherRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    info!(
        user_id = %user.user_id,
        product_id = %request.product_id,
        payment_method = request.payment_method.as_str(),
        order_recovered_id = ?request.order_recovered_id,
        "Voucher purchase initiated"
    );

    let response = state.services.purchase.execute(user.user_id, request).await?;

    let status = if response.success && response.payment_method == PaymentMethod::Balance {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    info!(
        user_id = %user.user_id,
        order_id = ?response.order_id,
        success = response.success,
        "Voucher purchase processed"
    );

    Ok((status, Json(response)))
}

/// Retry a failed order now instead of waiting for the background sweep
#[utoipa::path(
    post,
    path = "/api/v1/vouchers/orders/{id}/retry",
    summary = "Retry failed voucher order",
    params(("id" = String, Path, description = "Order UUID or external order id")),
    responses(
        (status = 200, description = "Recovery attempted", body = ApiResponse<VoucherOrderResponse>),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Order cannot be retried", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn retry_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(identifier): Path<String>,
) -> Result<Json<ApiResponse<VoucherOrderResponse>>, ServiceError> {
    let order = state
        .services
        .recovery
        .recover_for_user(&identifier, user.user_id, user.is_admin)
        .await?;

    let response = render(&state, &order).await?.with_recovery_info(&order);
    Ok(Json(
        ApiResponse::success(response).with_message("Order recovery initiated"),
    ))
}

pub fn voucher_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/retry", post(retry_order))
        .route("/purchase", post(purchase_voucher))
        .merge(super::catalog::catalog_routes())
}
