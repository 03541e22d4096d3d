use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{order, product, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::amilon::VoucherOrderGateway;
use crate::services::balance::BalancePaymentService;

/// An order in `error` is cancelled once this many recoveries have failed.
pub const MAX_RECOVERY_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecoveryResult {
    pub success: bool,
    pub message: String,
    pub new_status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryResult {
    fn recovered() -> Self {
        Self {
            success: true,
            message: "Order successfully recovered".to_string(),
            new_status: OrderStatus::Confirmed,
            error: None,
        }
    }

    fn failed(new_status: OrderStatus, error: String) -> Self {
        Self {
            success: false,
            message: format!("Recovery failed: {error}"),
            new_status,
            error: Some(error),
        }
    }
}

/// Counts from one sweep over the failed orders.
///
/// Each processed order lands in exactly one of the other three counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub processed: usize,
    pub recovered: usize,
    /// Still in `error`, to be retried by a later sweep
    pub failed: usize,
    pub cancelled: usize,
}

/// Retries vendor orders that failed after the user was charged nothing.
#[derive(Clone)]
pub struct VoucherRecoveryService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn VoucherOrderGateway>,
    balance: BalancePaymentService,
    events: EventSender,
}

impl VoucherRecoveryService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn VoucherOrderGateway>,
        balance: BalancePaymentService,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            balance,
            events,
        }
    }

    pub fn can_retry(order: &order::Model) -> bool {
        order.status == OrderStatus::Error && order.recovery_attempts < MAX_RECOVERY_ATTEMPTS
    }

    /// Orders in `error` with attempts left, oldest first.
    pub async fn identify_failed_orders(&self) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::Error))
            .filter(order::Column::RecoveryAttempts.lt(MAX_RECOVERY_ATTEMPTS))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// One recovery attempt. Vendor and payment failures are reported in the
    /// result; only storage errors are returned as `Err`.
    #[instrument(skip(self, order), fields(order_id = %order.id, external_order_id = %order.external_order_id))]
    pub async fn attempt_recovery(
        &self,
        order: &order::Model,
    ) -> Result<RecoveryResult, ServiceError> {
        let attempt = order.recovery_attempts + 1;
        let attempted_at = Utc::now();

        let mut active: order::ActiveModel = order.clone().into();
        active.recovery_attempts = Set(attempt);
        active.last_recovery_attempt = Set(Some(attempted_at));
        active.updated_at = Set(Some(attempted_at));
        let order = active.update(&*self.db).await?;

        info!(attempt, %attempted_at, "Attempting voucher order recovery");

        match self.place_and_charge(&order).await {
            Ok(()) => {
                let mut active: order::ActiveModel = order.clone().into();
                active.status = Set(OrderStatus::Confirmed);
                active.balance_amount_used = Set(order.amount);
                active.last_error = Set(None);
                active.updated_at = Set(Some(Utc::now()));
                active.update(&*self.db).await?;

                info!(attempt, "Voucher order recovered");
                self.events
                    .send_or_log(Event::VoucherOrderRecovered {
                        order_id: order.id,
                        attempts: attempt,
                    })
                    .await;

                Ok(RecoveryResult::recovered())
            }
            Err(e) => {
                let new_status = if attempt >= MAX_RECOVERY_ATTEMPTS {
                    OrderStatus::Cancelled
                } else {
                    OrderStatus::Error
                };
                let reason = e.to_string();

                let mut active: order::ActiveModel = order.clone().into();
                active.status = Set(new_status);
                active.last_error = Set(Some(reason.clone()));
                active.updated_at = Set(Some(Utc::now()));
                active.update(&*self.db).await?;

                warn!(attempt, error = %reason, new_status = %new_status, "Voucher order recovery failed");
                if new_status == OrderStatus::Cancelled {
                    self.events
                        .send_or_log(Event::VoucherOrderCancelled {
                            order_id: order.id,
                            attempts: attempt,
                        })
                        .await;
                } else if let Some(user_id) = order.user_id {
                    self.events
                        .send_or_log(Event::VoucherOrderFailed {
                            order_id: order.id,
                            user_id,
                            reason: reason.clone(),
                        })
                        .await;
                }

                Ok(RecoveryResult::failed(new_status, reason))
            }
        }
    }

    /// Re-places the vendor order, then charges the user for it.
    async fn place_and_charge(&self, order: &order::Model) -> Result<(), ServiceError> {
        let user_id = order
            .user_id
            .ok_or_else(|| ServiceError::InvalidOperation("Order has no user".into()))?;
        let product_id = order
            .product_id
            .ok_or_else(|| ServiceError::InvalidOperation("Order has no product".into()))?;
        let product = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product not found: {product_id}")))?;

        self.gateway
            .create_order(&product, 1, &order.external_order_id, Some(user_id), None)
            .await?;

        if let Err(e) = self.balance.process_payment(user_id, order.amount, order.id).await {
            error!(
                error = %e,
                %user_id,
                external_order_id = %order.external_order_id,
                amount = order.amount,
                "Voucher re-ordered but the balance debit failed"
            );
            return Err(e);
        }

        Ok(())
    }

    /// Sweeps every order returned by `identify_failed_orders`.
    pub async fn recover_all(&self) -> Result<RecoverySummary, ServiceError> {
        let orders = self.identify_failed_orders().await?;
        let mut summary = RecoverySummary::default();

        for order in &orders {
            summary.processed += 1;
            match self.attempt_recovery(order).await {
                Ok(result) if result.success => summary.recovered += 1,
                Ok(result) if result.new_status == OrderStatus::Cancelled => {
                    summary.cancelled += 1
                }
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(error = %e, order_id = %order.id, "Recovery attempt aborted");
                }
            }
        }

        info!(
            processed = summary.processed,
            recovered = summary.recovered,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Voucher recovery sweep finished"
        );
        Ok(summary)
    }

    /// Retries one order on behalf of `user_id` and returns it refreshed,
    /// whatever the outcome of the attempt.
    pub async fn recover_for_user(
        &self,
        identifier: &str,
        user_id: Uuid,
        is_admin: bool,
    ) -> Result<order::Model, ServiceError> {
        let order = order::find_by_identifier(&*self.db, identifier)
            .await?
            .filter(|o| is_admin || o.user_id == Some(user_id))
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if !Self::can_retry(&order) {
            return Err(ServiceError::InvalidOperation(
                "Order cannot be retried".to_string(),
            ));
        }

        let result = self.attempt_recovery(&order).await?;
        info!(order_id = %order.id, success = result.success, message = %result.message, "Manual recovery finished");

        order::Entity::find_by_id(order.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))
    }
}

/// Runs `recover_all` every `interval` until the task is aborted.
pub fn spawn_recovery_worker(
    service: Arc<VoucherRecoveryService>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting voucher recovery worker");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = service.recover_all().await {
                error!(error = %e, "Voucher recovery sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::OrderDto;
    use crate::services::amilon::MockVoucherOrderGateway;
    use crate::services::test_support::{events, insert_order, insert_product, memory_db, seed_balance};
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serde_json::json;

    fn service(db: &Arc<DatabaseConnection>, gateway: MockVoucherOrderGateway) -> VoucherRecoveryService {
        VoucherRecoveryService::new(
            db.clone(),
            Arc::new(gateway),
            BalancePaymentService::new(db.clone(), events()),
            events(),
        )
    }

    fn succeeding_gateway() -> MockVoucherOrderGateway {
        let mut gateway = MockVoucherOrderGateway::new();
        gateway
            .expect_create_order()
            .returning(|product, _, external_order_id, _, _| {
                Ok(OrderDto::from_api_response(
                    &json!({"orderId": "AM-R"}),
                    product,
                    product.net_price,
                    external_order_id,
                    None,
                ))
            });
        gateway
    }

    fn failing_gateway(times: usize) -> MockVoucherOrderGateway {
        let mut gateway = MockVoucherOrderGateway::new();
        gateway
            .expect_create_order()
            .times(times)
            .returning(|_, _, _, _, _| Err(ServiceError::AmilonOrder("API error".into())));
        gateway
    }

    async fn reload(db: &DatabaseConnection, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id).one(db).await.unwrap().unwrap()
    }

    #[rstest]
    #[case(OrderStatus::Error, 0, true)]
    #[case(OrderStatus::Error, 2, true)]
    #[case(OrderStatus::Error, 3, false)]
    #[case(OrderStatus::Cancelled, 1, false)]
    #[case(OrderStatus::Confirmed, 0, false)]
    #[case(OrderStatus::Pending, 0, false)]
    #[tokio::test]
    async fn retry_eligibility(#[case] status: OrderStatus, #[case] attempts: i32, #[case] expected: bool) {
        let db = memory_db().await;
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let order = insert_order(&db, &product, Uuid::new_v4(), status, attempts).await;
        assert_eq!(VoucherRecoveryService::can_retry(&order), expected);
    }

    #[tokio::test]
    async fn identifies_only_retryable_orders() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let user = Uuid::new_v4();
        let first = insert_order(&db, &product, user, OrderStatus::Error, 0).await;
        let second = insert_order(&db, &product, user, OrderStatus::Error, 2).await;
        insert_order(&db, &product, user, OrderStatus::Confirmed, 0).await;
        insert_order(&db, &product, user, OrderStatus::Cancelled, 0).await;
        insert_order(&db, &product, user, OrderStatus::Error, 3).await;

        let svc = service(&db, MockVoucherOrderGateway::new());
        let ids: Vec<Uuid> = svc
            .identify_failed_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn successful_recovery_confirms_and_debits() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let user = Uuid::new_v4();
        seed_balance(&db, user, 8_000).await;
        let order = insert_order(&db, &product, user, OrderStatus::Error, 0).await;

        let svc = service(&db, succeeding_gateway());
        let result = svc.attempt_recovery(&order).await.unwrap();
        assert!(result.success);
        assert_eq!(result.message, "Order successfully recovered");
        assert_eq!(result.new_status, OrderStatus::Confirmed);

        let order = reload(&db, order.id).await;
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.recovery_attempts, 1);
        assert_eq!(order.balance_amount_used, 5_000);
        assert!(order.last_error.is_none());
        assert!(order.last_recovery_attempt.is_some());

        let balance = BalancePaymentService::new(db.clone(), events());
        assert_eq!(balance.balance(user).await.unwrap(), 3_000);
    }

    #[tokio::test]
    async fn third_failure_cancels_the_order() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let order = insert_order(&db, &product, Uuid::new_v4(), OrderStatus::Error, 2).await;

        let svc = service(&db, failing_gateway(1));
        let result = svc.attempt_recovery(&order).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.new_status, OrderStatus::Cancelled);
        assert!(result.error.unwrap().contains("API error"));

        let order = reload(&db, order.id).await;
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.recovery_attempts, 3);
        assert!(order.last_error.unwrap().contains("API error"));
    }

    #[tokio::test]
    async fn failure_with_attempts_left_stays_in_error() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let order = insert_order(&db, &product, Uuid::new_v4(), OrderStatus::Error, 1).await;

        let svc = service(&db, failing_gateway(1));
        let result = svc.attempt_recovery(&order).await.unwrap();
        assert_eq!(result.new_status, OrderStatus::Error);

        let order = reload(&db, order.id).await;
        assert_eq!(order.status, OrderStatus::Error);
        assert_eq!(order.recovery_attempts, 2);
    }

    #[tokio::test]
    async fn failed_debit_counts_as_a_failed_attempt() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let user = Uuid::new_v4();
        seed_balance(&db, user, 10).await;
        let order = insert_order(&db, &product, user, OrderStatus::Error, 0).await;

        let svc = service(&db, succeeding_gateway());
        let result = svc.attempt_recovery(&order).await.unwrap();
        assert!(!result.success);

        let order = reload(&db, order.id).await;
        assert_eq!(order.status, OrderStatus::Error);
        assert!(order.last_error.unwrap().contains("Insufficient balance"));
    }

    #[tokio::test]
    async fn sweep_reports_counts() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let user = Uuid::new_v4();
        insert_order(&db, &product, user, OrderStatus::Error, 0).await;
        insert_order(&db, &product, user, OrderStatus::Error, 2).await;

        let svc = service(&db, failing_gateway(2));
        let summary = svc.recover_all().await.unwrap();
        assert_eq!(
            summary,
            RecoverySummary {
                processed: 2,
                recovered: 0,
                failed: 1,
                cancelled: 1
            }
        );
    }

    #[tokio::test]
    async fn users_can_only_retry_their_own_orders() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let owner = Uuid::new_v4();
        let order = insert_order(&db, &product, owner, OrderStatus::Error, 0).await;

        let svc = service(&db, failing_gateway(1));
        assert_matches!(
            svc.recover_for_user(&order.id.to_string(), Uuid::new_v4(), false).await,
            Err(ServiceError::NotFound(_))
        );

        let refreshed = svc
            .recover_for_user(&order.external_order_id, Uuid::new_v4(), true)
            .await
            .unwrap();
        assert_eq!(refreshed.recovery_attempts, 1);
        assert_eq!(refreshed.status, OrderStatus::Error);
    }

    #[tokio::test]
    async fn settled_orders_cannot_be_retried() {
        let db = Arc::new(memory_db().await);
        let product = insert_product(&db, "AMZ-50", 5_000).await;
        let owner = Uuid::new_v4();
        let order = insert_order(&db, &product, owner, OrderStatus::Confirmed, 0).await;

        let svc = service(&db, MockVoucherOrderGateway::new());
        assert_matches!(
            svc.recover_for_user(&order.id.to_string(), owner, false).await,
            Err(ServiceError::InvalidOperation(ref msg)) if msg == "Order cannot be retried"
        );
    }
}
