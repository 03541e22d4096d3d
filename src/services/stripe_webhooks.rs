use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::StripeConfig;
use crate::db::is_unique_violation;
use crate::entities::credit_balance::CASH;
use crate::entities::{processed_webhook_event, stripe_payment, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{Notification, NotificationHub};
use crate::services::balance::add_credit;

type HmacSha256 = Hmac<Sha256>;

/// The parts of a Stripe event envelope this service reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Ignored,
}

/// Side effects released only once the processing transaction has committed.
enum AfterCommit {
    Emit(Event),
    Notify(Notification),
}

/// Verifies Stripe webhook deliveries and applies them to payments and balances.
#[derive(Clone)]
pub struct StripeWebhookService {
    db: Arc<DatabaseConnection>,
    config: StripeConfig,
    notifications: NotificationHub,
    events: EventSender,
}

impl StripeWebhookService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: StripeConfig,
        notifications: NotificationHub,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            config,
            notifications,
            events,
        }
    }

    /// Checks the `Stripe-Signature` header against the configured secrets and parses the event.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<StripeEvent, ServiceError> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())
    }

    fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<StripeEvent, ServiceError> {
        if signature_header.trim().is_empty() {
            error!("Stripe webhook signature is empty");
            return Err(ServiceError::WebhookVerification(
                "Webhook signature is missing".into(),
            ));
        }

        let primary = self
            .config
            .webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty());
        let cli = self
            .config
            .webhook_secret_cli
            .as_deref()
            .filter(|s| !s.is_empty() && Some(*s) != primary);

        let Some(primary) = primary.or(cli) else {
            error!("No Stripe webhook secret configured");
            return Err(ServiceError::WebhookVerification(
                "Webhook secret is not configured".into(),
            ));
        };

        if primary.starts_with("whsec_") && parse_signature_header(signature_header).is_none() {
            error!(signature = %signature_header, "Stripe webhook signature has invalid format");
            return Err(ServiceError::WebhookVerification(
                "Webhook signature has invalid format".into(),
            ));
        }

        let tolerance = self.config.tolerance_secs();
        let verified = match check_signature(payload, signature_header, primary, tolerance, now) {
            Ok(()) => true,
            Err(primary_error) => match cli.filter(|cli| *cli != primary) {
                Some(cli) => {
                    debug!("Primary secret failed, trying CLI secret");
                    match check_signature(payload, signature_header, cli, tolerance, now) {
                        Ok(()) => true,
                        Err(cli_error) => {
                            error!(
                                primary_error,
                                cli_error,
                                "Stripe webhook signature verification failed with both secrets"
                            );
                            false
                        }
                    }
                }
                None => {
                    error!(error = primary_error, "Stripe webhook signature verification failed");
                    false
                }
            },
        };

        if !verified {
            return Err(ServiceError::WebhookVerification(
                "Webhook signature verification failed".into(),
            ));
        }

        serde_json::from_slice(payload).map_err(|e| {
            ServiceError::WebhookVerification(format!("Invalid webhook payload: {e}"))
        })
    }

    /// Applies a verified event exactly once.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: &StripeEvent) -> Result<WebhookOutcome, ServiceError> {
        let event = event.clone();
        let (outcome, after_commit) = self
            .db
            .transaction::<_, (WebhookOutcome, Vec<AfterCommit>), ServiceError>(|txn| {
                Box::pin(async move { apply_event(txn, &event).await })
            })
            .await?;

        for effect in after_commit {
            match effect {
                AfterCommit::Emit(event) => self.events.send_or_log(event).await,
                AfterCommit::Notify(notification) => {
                    self.notifications.publish(notification);
                }
            }
        }

        Ok(outcome)
    }
}

async fn apply_event<C: ConnectionTrait>(
    conn: &C,
    event: &StripeEvent,
) -> Result<(WebhookOutcome, Vec<AfterCommit>), ServiceError> {
    let seen = processed_webhook_event::Entity::find()
        .filter(processed_webhook_event::Column::EventId.eq(event.id.as_str()))
        .one(conn)
        .await?;
    if seen.is_some() {
        info!(event_id = %event.id, "Skipping duplicate webhook event");
        return Ok((WebhookOutcome::Duplicate, Vec::new()));
    }

    let ledger = processed_webhook_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        event_id: Set(event.id.clone()),
        event_type: Set(event.event_type.clone()),
        processed_at: Set(Utc::now()),
    };
    if let Err(e) = ledger.insert(conn).await {
        if is_unique_violation(&e) {
            info!(event_id = %event.id, "Webhook event recorded concurrently, skipping");
            return Ok((WebhookOutcome::Duplicate, Vec::new()));
        }
        return Err(e.into());
    }

    let object = &event.data.object;
    let effects = match event.event_type.as_str() {
        "payment_intent.succeeded" => payment_intent_succeeded(conn, object).await?,
        "payment_intent.payment_failed" => payment_intent_failed(conn, object).await?,
        "checkout.session.completed" => checkout_session_completed(conn, object).await?,
        other => {
            info!(event_type = other, "Unhandled webhook event type");
            return Ok((WebhookOutcome::Ignored, Vec::new()));
        }
    };

    Ok((WebhookOutcome::Processed, effects))
}

async fn find_payment_locked<C: ConnectionTrait>(
    conn: &C,
    column: stripe_payment::Column,
    value: &str,
) -> Result<Option<stripe_payment::Model>, ServiceError> {
    Ok(stripe_payment::Entity::find()
        .filter(column.eq(value))
        .lock_exclusive()
        .one(conn)
        .await?)
}

fn payment_metadata(payment: &stripe_payment::Model) -> Map<String, Value> {
    json!({
        "stripe_payment_id": payment.stripe_payment_id,
        "amount": payment.amount,
        "credit_amount": payment.credit_amount,
        "credit_type": payment.credit_type,
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

async fn payment_intent_succeeded<C: ConnectionTrait>(
    conn: &C,
    intent: &Value,
) -> Result<Vec<AfterCommit>, ServiceError> {
    let Some(intent_id) = intent.get("id").and_then(Value::as_str) else {
        warn!("payment_intent.succeeded without an intent id");
        return Ok(Vec::new());
    };

    let Some(payment) =
        find_payment_locked(conn, stripe_payment::Column::StripePaymentId, intent_id).await?
    else {
        error!(payment_intent_id = intent_id, "Payment record not found for successful payment intent");
        return Ok(Vec::new());
    };

    if payment.status == PaymentStatus::Completed {
        info!(payment_id = %payment.id, "Payment already completed");
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut active: stripe_payment::ActiveModel = payment.clone().into();
    active.status = Set(PaymentStatus::Completed);
    active.processed_at = Set(Some(now));
    active.updated_at = Set(Some(now));
    let payment = active.update(conn).await?;

    add_credit(
        conn,
        payment.user_id,
        CASH,
        payment.amount,
        &format!("Stripe payment: {intent_id}"),
    )
    .await?;

    info!(payment_id = %payment.id, user_id = %payment.user_id, amount = payment.amount, "Stripe payment completed");

    Ok(vec![
        AfterCommit::Emit(Event::StripePaymentSucceeded {
            payment_id: payment.id,
            user_id: payment.user_id,
            amount: payment.amount,
        }),
        AfterCommit::Emit(Event::BalanceCredited {
            user_id: payment.user_id,
            amount: payment.amount,
            credit_type: CASH.to_string(),
        }),
        AfterCommit::Notify(Notification::payment_status(
            payment.user_id,
            payment.id,
            PaymentStatus::Completed.as_str(),
            Value::Object(payment_metadata(&payment)),
        )),
    ])
}

async fn payment_intent_failed<C: ConnectionTrait>(
    conn: &C,
    intent: &Value,
) -> Result<Vec<AfterCommit>, ServiceError> {
    let Some(intent_id) = intent.get("id").and_then(Value::as_str) else {
        warn!("payment_intent.payment_failed without an intent id");
        return Ok(Vec::new());
    };

    let Some(payment) =
        find_payment_locked(conn, stripe_payment::Column::StripePaymentId, intent_id).await?
    else {
        error!(payment_intent_id = intent_id, "Payment record not found for failed payment intent");
        return Ok(Vec::new());
    };

    let last_error = intent.get("last_payment_error");
    let error_message = last_error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let error_code = last_error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut metadata = payment
        .metadata
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    metadata.insert("failure_code".into(), json!(error_code));
    metadata.insert("failure_message".into(), json!(error_message));

    let now = Utc::now();
    let mut active: stripe_payment::ActiveModel = payment.into();
    active.status = Set(PaymentStatus::Failed);
    active.processed_at = Set(Some(now));
    active.error_message = Set(error_message.clone());
    active.metadata = Set(Some(Value::Object(metadata)));
    active.updated_at = Set(Some(now));
    let payment = active.update(conn).await?;

    warn!(payment_id = %payment.id, user_id = %payment.user_id, error = ?error_message, "Stripe payment failed");

    let mut notification_metadata = payment_metadata(&payment);
    notification_metadata.insert("error_message".into(), json!(error_message));
    notification_metadata.insert("failure_code".into(), json!(error_code));

    Ok(vec![
        AfterCommit::Emit(Event::StripePaymentFailed {
            payment_id: payment.id,
            user_id: payment.user_id,
            reason: error_message,
        }),
        AfterCommit::Notify(Notification::payment_status(
            payment.user_id,
            payment.id,
            PaymentStatus::Failed.as_str(),
            Value::Object(notification_metadata),
        )),
    ])
}

async fn checkout_session_completed<C: ConnectionTrait>(
    conn: &C,
    session: &Value,
) -> Result<Vec<AfterCommit>, ServiceError> {
    let Some(session_id) = session.get("id").and_then(Value::as_str) else {
        warn!("checkout.session.completed without a session id");
        return Ok(Vec::new());
    };

    let Some(payment) =
        find_payment_locked(conn, stripe_payment::Column::StripeCheckoutId, session_id).await?
    else {
        error!(session_id, "Payment record not found for completed checkout session");
        return Ok(Vec::new());
    };

    if payment.status == PaymentStatus::Completed {
        info!(payment_id = %payment.id, "Checkout payment already completed");
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut active: stripe_payment::ActiveModel = payment.into();
    active.status = Set(PaymentStatus::Completed);
    active.processed_at = Set(Some(now));
    active.updated_at = Set(Some(now));
    if let Some(intent_id) = session.get("payment_intent").and_then(Value::as_str) {
        active.stripe_payment_id = Set(Some(intent_id.to_string()));
    }
    let payment = active.update(conn).await?;

    add_credit(
        conn,
        payment.user_id,
        &payment.credit_type,
        payment.credit_amount,
        &format!(
            "Stripe payment: {}",
            payment.stripe_payment_id.as_deref().unwrap_or(session_id)
        ),
    )
    .await?;

    info!(
        payment_id = %payment.id,
        user_id = %payment.user_id,
        credit_amount = payment.credit_amount,
        credit_type = %payment.credit_type,
        "Checkout session completed"
    );

    Ok(vec![
        AfterCommit::Emit(Event::StripePaymentSucceeded {
            payment_id: payment.id,
            user_id: payment.user_id,
            amount: payment.amount,
        }),
        AfterCommit::Emit(Event::BalanceCredited {
            user_id: payment.user_id,
            amount: payment.credit_amount,
            credit_type: payment.credit_type.clone(),
        }),
        AfterCommit::Notify(Notification::payment_status(
            payment.user_id,
            payment.id,
            PaymentStatus::Completed.as_str(),
            Value::Object(payment_metadata(&payment)),
        )),
    ])
}

/// `t=…,v1=…[,v1=…]` into the timestamp and every `v1` signature.
fn parse_signature_header(header: &str) -> Option<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for element in header.split(',') {
        let (key, value) = element.trim().split_once('=')?;
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" if !value.is_empty() => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(t) if !signatures.is_empty() => Some((t, signatures)),
        _ => None,
    }
}

fn check_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), &'static str> {
    let (timestamp, signatures) = parse_signature_header(header)
        .ok_or("Unable to extract timestamp and signatures from header")?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "Invalid webhook secret")?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err("No signatures found matching the expected signature for payload");
    }

    let tolerance = i64::try_from(tolerance_secs).unwrap_or(i64::MAX);
    if now.saturating_sub(timestamp).saturating_abs() > tolerance {
        return Err("Timestamp outside the tolerance zone");
    }

    Ok(())
}
