use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::services::stripe_webhooks::WebhookOutcome;
use crate::AppState;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
}

/// Stripe webhook receiver. The signature covers the raw body, so it is read as bytes.
#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/webhook",
    summary = "Stripe webhook",
    request_body(content = String, description = "Raw Stripe event JSON", content_type = "application/json"),
    params(("Stripe-Signature" = String, Header, description = "t=<timestamp>,v1=<hmac>")),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Signature or payload rejected", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let service = &state.services.stripe_webhooks;
    let event = service.verify(&body, signature).map_err(|e| {
        warn!(error = %e, payload_bytes = body.len(), "Rejected Stripe webhook");
        e
    })?;

    info!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

    let outcome = service.process_event(&event).await?;
    Ok(Json(WebhookAck {
        received: true,
        duplicate: (outcome == WebhookOutcome::Duplicate).then_some(true),
    }))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/stripe/webhook", post(stripe_webhook))
}
