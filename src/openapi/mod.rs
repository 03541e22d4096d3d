use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Engage Vouchers API",
        version = "1.0.0",
        description = r#"
# Engage Vouchers API

Voucher purchases through the Amilon B2B catalogue, paid from the user's cash balance.

## Identity

Requests are authenticated upstream. The gateway forwards the caller as:

```
x-user-id: <uuid>
x-user-role: admin   (optional)
```

## Money

Every amount is an integer number of cents.

## Errors

```json
{
  "error": "Unprocessable Entity",
  "message": "Insufficient balance: available 500 cents, required 2500 cents",
  "request_id": "req-abc123",
  "timestamp": "2025-01-01T00:00:00Z"
}
```
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "vouchers", description = "Voucher orders and purchases"),
        (name = "payments", description = "Stripe webhook reconciliation"),
        (name = "notifications", description = "Real-time purchase notifications"),
        (name = "health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::purchase_voucher,
        crate::handlers::orders::retry_order,
        crate::handlers::catalog::list_merchants,
        crate::handlers::catalog::list_products,
        crate::handlers::webhooks::stripe_webhook,
        crate::handlers::notifications::notification_stream,
        crate::handlers::health::health_check,
        crate::handlers::health::amilon_health,
    ),
    components(
        schemas(
            crate::handlers::orders::VoucherOrderResponse,
            crate::handlers::orders::RecoveryInfo,
            crate::handlers::catalog::CatalogMerchant,
            crate::handlers::catalog::CatalogProduct,
            crate::services::purchase::PurchaseVoucherRequest,
            crate::services::purchase::PurchaseVoucherResponse,
            crate::services::balance::PaymentResult,
            crate::dto::OrderDto,
            crate::dto::OrderItemDto,
            crate::dto::OrderStatusSummary,
            crate::entities::OrderStatus,
            crate::entities::PaymentMethod,
            crate::notifications::Notification,
            crate::handlers::webhooks::WebhookAck,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
