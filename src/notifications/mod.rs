use chrono::{DateTime, Utc};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Progress steps reported to the buyer while a voucher purchase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VoucherNotificationStatus {
    Created,
    Completed,
    BalanceRestored,
    AmilonOrderCreated,
    VouchersReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherErrorCode {
    AmilonOrderFailed,
    AmilonApiError,
    PaymentFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "event")]
pub enum NotificationPayload {
    VoucherPurchaseNotification {
        order_id: String,
        status: VoucherNotificationStatus,
        order_data: Value,
        message: String,
    },
    VoucherPurchaseError {
        error_code: VoucherErrorCode,
        error_message: String,
        context: Value,
    },
    VoucherPaymentStatusUpdate {
        payment_id: String,
        status: String,
        payment_method: String,
        metadata: Value,
    },
}

impl NotificationPayload {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::VoucherPurchaseNotification { .. } => "VoucherPurchaseNotification",
            Self::VoucherPurchaseError { .. } => "VoucherPurchaseError",
            Self::VoucherPaymentStatusUpdate { .. } => "VoucherPaymentStatusUpdate",
        }
    }
}

/// A message for one user's private channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub payload: NotificationPayload,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    pub fn purchase(
        user_id: Uuid,
        order_id: impl ToString,
        status: VoucherNotificationStatus,
        order_data: Value,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            payload: NotificationPayload::VoucherPurchaseNotification {
                order_id: order_id.to_string(),
                status,
                order_data,
                message: message.into(),
            },
            sent_at: Utc::now(),
        }
    }

    pub fn purchase_error(
        user_id: Uuid,
        error_code: VoucherErrorCode,
        error_message: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            user_id,
            payload: NotificationPayload::VoucherPurchaseError {
                error_code,
                error_message: error_message.into(),
                context,
            },
            sent_at: Utc::now(),
        }
    }

    pub fn payment_status(
        user_id: Uuid,
        payment_id: impl ToString,
        status: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            user_id,
            payload: NotificationPayload::VoucherPaymentStatusUpdate {
                payment_id: payment_id.to_string(),
                status: status.into(),
                payment_method: "stripe".to_string(),
                metadata,
            },
            sent_at: Utc::now(),
        }
    }
}

/// Fan-out of notifications to every connected client stream.
///
/// Delivery is best effort: with nobody listening a notification is dropped.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the notification.
    pub fn publish(&self, notification: Notification) -> usize {
        let event = notification.payload.event_name();
        let user_id = notification.user_id;
        match self.sender.send(notification) {
            Ok(receivers) => {
                debug!(event, %user_id, receivers, "notification broadcast");
                receivers
            }
            Err(_) => {
                debug!(event, %user_id, "notification dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Stream of the notifications addressed to `user_id`. Lagging subscribers skip ahead.
    pub fn user_stream(&self, user_id: Uuid) -> impl Stream<Item = Notification> + Send + 'static {
        stream::unfold(self.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) if notification.user_id == user_id => {
                        return Some((notification, rx))
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%user_id, skipped, "notification stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}
