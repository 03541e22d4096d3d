use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the processor is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "domain event dropped");
        }
    }
}

/// Domain events emitted by the voucher pipeline, consumed for metrics and auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    VoucherOrderCreated {
        order_id: Uuid,
        user_id: Option<Uuid>,
        external_order_id: String,
    },
    VoucherOrderFailed {
        order_id: Uuid,
        user_id: Uuid,
        reason: String,
    },
    VoucherOrderRecovered {
        order_id: Uuid,
        attempts: i32,
    },
    VoucherOrderCancelled {
        order_id: Uuid,
        attempts: i32,
    },
    BalanceDebited {
        user_id: Uuid,
        amount: i64,
        order_id: Uuid,
    },
    BalanceCredited {
        user_id: Uuid,
        amount: i64,
        credit_type: String,
    },
    StripePaymentSucceeded {
        payment_id: Uuid,
        user_id: Uuid,
        amount: i64,
    },
    StripePaymentFailed {
        payment_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::VoucherOrderCreated { .. } => "voucher_order_created",
            Event::VoucherOrderFailed { .. } => "voucher_order_failed",
            Event::VoucherOrderRecovered { .. } => "voucher_order_recovered",
            Event::VoucherOrderCancelled { .. } => "voucher_order_cancelled",
            Event::BalanceDebited { .. } => "balance_debited",
            Event::BalanceCredited { .. } => "balance_credited",
            Event::StripePaymentSucceeded { .. } => "stripe_payment_succeeded",
            Event::StripePaymentFailed { .. } => "stripe_payment_failed",
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::VoucherOrderCreated {
                order_id,
                user_id,
                external_order_id,
            } => info!(
                event = event.name(),
                %order_id,
                user_id = ?user_id,
                %external_order_id,
                "voucher order created"
            ),
            Event::VoucherOrderFailed {
                order_id,
                user_id,
                reason,
            } => warn!(event = event.name(), %order_id, %user_id, %reason, "voucher order failed"),
            Event::VoucherOrderRecovered { order_id, attempts } => {
                info!(event = event.name(), %order_id, attempts, "voucher order recovered")
            }
            Event::VoucherOrderCancelled { order_id, attempts } => warn!(
                event = event.name(),
                %order_id,
                attempts,
                "voucher order cancelled after exhausting recovery"
            ),
            Event::BalanceDebited {
                user_id,
                amount,
                order_id,
            } => info!(event = event.name(), %user_id, amount, %order_id, "balance debited"),
            Event::BalanceCredited {
                user_id,
                amount,
                credit_type,
            } => info!(event = event.name(), %user_id, amount, %credit_type, "balance credited"),
            Event::StripePaymentSucceeded {
                payment_id,
                user_id,
                amount,
            } => info!(event = event.name(), %payment_id, %user_id, amount, "stripe payment succeeded"),
            Event::StripePaymentFailed {
                payment_id,
                user_id,
                reason,
            } => warn!(
                event = event.name(),
                %payment_id,
                %user_id,
                reason = ?reason,
                "stripe payment failed"
            ),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender
            .send(Event::VoucherOrderRecovered {
                order_id,
                attempts: 2,
            })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Event::VoucherOrderRecovered {
                order_id,
                attempts: 2
            })
        );
    }

    #[tokio::test]
    async fn send_fails_once_processor_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        let result = sender
            .send(Event::VoucherOrderCancelled {
                order_id: Uuid::new_v4(),
                attempts: 3,
            })
            .await;
        assert!(result.is_err());
        // must not panic
        sender
            .send_or_log(Event::VoucherOrderCancelled {
                order_id: Uuid::new_v4(),
                attempts: 3,
            })
            .await;
    }
}
