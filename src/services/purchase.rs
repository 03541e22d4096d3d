use chrono::Utc;
use rand::Rng;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::dto::OrderDto;
use crate::entities::{order, product, OrderStatus, PaymentMethod};
use crate::errors::ServiceError;
use crate::notifications::{
    Notification, NotificationHub, VoucherErrorCode, VoucherNotificationStatus,
};
use crate::services::amilon::VoucherOrderGateway;
use crate::services::balance::{BalancePaymentService, PaymentResult};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PurchaseVoucherRequest {
    pub product_id: Uuid,
    pub payment_method: PaymentMethod,
    pub stripe_payment_id: Option<String>,
    /// Cents
    #[validate(range(min = 0))]
    pub balance_amount: Option<i64>,
    /// Cancelled order this purchase replaces
    pub order_recovered_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurchaseVoucherResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    pub payment_method: PaymentMethod,
    pub amount_paid: i64,
    pub remaining_balance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amilon_order: Option<OrderDto>,
}

impl PurchaseVoucherResponse {
    fn unavailable(payment_method: PaymentMethod) -> Self {
        Self {
            success: false,
            message: Some("Product is not available for purchase".to_string()),
            order_id: None,
            payment_method,
            amount_paid: 0,
            remaining_balance: 0,
            amilon_order: None,
        }
    }
}

/// Buys a single voucher with the user's cash balance.
#[derive(Clone)]
pub struct PurchaseVoucherService {
    db: Arc<DatabaseConnection>,
    balance: BalancePaymentService,
    gateway: Arc<dyn VoucherOrderGateway>,
    notifications: NotificationHub,
}

impl PurchaseVoucherService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        balance: BalancePaymentService,
        gateway: Arc<dyn VoucherOrderGateway>,
        notifications: NotificationHub,
    ) -> Self {
        Self {
            db,
            balance,
            gateway,
            notifications,
        }
    }

    /// `ENGAGE-{YYYYMMDDHHMMSS}-{4 digits}`
    pub fn generate_order_reference() -> String {
        let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
        format!("ENGAGE-{}-{:04}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
    }

    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn execute(
        &self,
        user_id: Uuid,
        request: PurchaseVoucherRequest,
    ) -> Result<PurchaseVoucherResponse, ServiceError> {
        request.validate()?;

        let product = product::Entity::find_by_id(request.product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Product not found".to_string()))?;

        if !product.is_available {
            info!(%user_id, product_id = %product.id, "Voucher product is not available");
            return Ok(PurchaseVoucherResponse::unavailable(request.payment_method));
        }

        if request.payment_method != PaymentMethod::Balance {
            return Err(ServiceError::InvalidPaymentMethod(format!(
                "{} purchases are not processed with balance",
                request.payment_method.as_str()
            )));
        }

        let order = self.create_pending_order(user_id, &product, &request).await?;
        let is_recovery = request.order_recovered_id.is_some();
        if let Some(recovered) = request.order_recovered_id {
            info!(
                new_order_id = %order.id,
                recovered_order_id = %recovered,
                %user_id,
                "Creating new order to recover cancelled order"
            );
        }

        self.notifications.publish(Notification::purchase(
            user_id,
            order.id,
            VoucherNotificationStatus::Created,
            json!({
                "product_name": product.name,
                "amount_cents": product.net_price,
                "merchant_id": product.merchant_id,
                "payment_method": request.payment_method,
                "is_recovery": is_recovery,
            }),
            if is_recovery {
                "Recovering your cancelled voucher order"
            } else {
                "Your voucher order has been created"
            },
        ));

        let mut debited = 0;
        match self
            .pay_and_place(user_id, &product, &order, &request, &mut debited)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => {
                self.fail(user_id, &product, &order, &request, debited, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn create_pending_order(
        &self,
        user_id: Uuid,
        product: &product::Model,
        request: &PurchaseVoucherRequest,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            external_order_id: Set(Self::generate_order_reference()),
            user_id: Set(Some(user_id)),
            product_id: Set(Some(product.id)),
            merchant_id: Set(product.merchant_id),
            amount: Set(product.net_price),
            total_amount: Set(Some(product.price)),
            status: Set(OrderStatus::Pending),
            payment_method: Set(Some(request.payment_method)),
            stripe_payment_id: Set(request.stripe_payment_id.clone()),
            balance_amount_used: Set(0),
            product_name: Set(Some(product.name.clone())),
            currency: Set(product.currency.clone()),
            recovery_attempts: Set(0),
            order_recovered_id: Set(request.order_recovered_id),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .insert(&*self.db)
        .await?;

        info!(order_id = %order.id, external_order_id = %order.external_order_id, %user_id, "Voucher order created");
        Ok(order)
    }

    async fn pay_and_place(
        &self,
        user_id: Uuid,
        product: &product::Model,
        order: &order::Model,
        request: &PurchaseVoucherRequest,
        debited: &mut i64,
    ) -> Result<PurchaseVoucherResponse, ServiceError> {
        let amount = product.net_price;
        debug!(net_price = amount, "Processing balance payment");

        let payment = if amount > 0 {
            let payment = self.balance.process_payment(user_id, amount, order.id).await?;
            *debited = payment.amount_debited;
            self.update_order(order, |active| {
                active.balance_amount_used = Set(payment.amount_debited)
            })
            .await?;
            payment
        } else {
            PaymentResult {
                amount_debited: 0,
                remaining_balance: self.balance.balance(user_id).await?,
                transaction_id: Uuid::new_v4(),
            }
        };

        self.notifications.publish(Notification::purchase(
            user_id,
            order.id,
            VoucherNotificationStatus::Completed,
            json!({
                "product_name": product.name,
                "amount_paid": payment.amount_debited,
                "remaining_balance": payment.remaining_balance,
                "payment_method": request.payment_method,
                "stripe_payment_id": request.stripe_payment_id,
            }),
            "Your voucher purchase has been completed successfully",
        ));

        let amilon_order = self
            .gateway
            .create_order(product, 1, &order.external_order_id, Some(user_id), None)
            .await?;

        self.update_order(order, |active| active.status = Set(OrderStatus::Confirmed))
            .await?;

        Ok(PurchaseVoucherResponse {
            success: true,
            message: None,
            order_id: Some(order.id),
            payment_method: request.payment_method,
            amount_paid: payment.amount_debited,
            remaining_balance: payment.remaining_balance,
            amilon_order: Some(amilon_order),
        })
    }

    /// Restores the balance and marks the order failed. Errors here are logged only.
    async fn fail(
        &self,
        user_id: Uuid,
        product: &product::Model,
        order: &order::Model,
        request: &PurchaseVoucherRequest,
        debited: i64,
        cause: &ServiceError,
    ) {
        error!(
            error = %cause,
            order_id = %order.id,
            %user_id,
            vendor = cause.is_vendor_error(),
            "Voucher purchase failed"
        );

        if debited > 0 {
            self.restore_balance(user_id, debited, order).await;
        }

        let last_error = cause.to_string();
        if let Err(e) = self
            .update_order(order, |active| {
                active.status = Set(OrderStatus::Error);
                active.last_error = Set(Some(last_error));
                active.balance_amount_used = Set(0);
            })
            .await
        {
            error!(error = %e, order_id = %order.id, "Failed to mark voucher order as errored");
        }

        let (code, message) = if cause.is_vendor_error() {
            (
                VoucherErrorCode::AmilonApiError,
                format!("Amilon API error: {cause}"),
            )
        } else {
            (VoucherErrorCode::PaymentFailed, cause.to_string())
        };
        self.notifications.publish(Notification::purchase_error(
            user_id,
            code,
            message,
            json!({
                "product_id": product.id,
                "payment_method": request.payment_method,
                "order_id": order.id,
            }),
        ));
    }

    async fn restore_balance(&self, user_id: Uuid, amount: i64, order: &order::Model) {
        match self
            .balance
            .refund(user_id, amount, "Voucher purchase failed - balance restored")
            .await
        {
            Ok(_) => {
                info!(%user_id, amount_cents = amount, order_id = %order.id, "User balance restored after voucher purchase failure");
                self.notifications.publish(Notification::purchase(
                    user_id,
                    order.id,
                    VoucherNotificationStatus::BalanceRestored,
                    json!({
                        "amount_restored": amount,
                        "reason": "Voucher purchase failed - balance restored",
                    }),
                    "Your balance has been restored due to purchase failure",
                ));
            }
            Err(e) => {
                error!(error = %e, %user_id, amount_cents = amount, order_id = %order.id, "Failed to restore user balance");
            }
        }
    }

    async fn update_order(
        &self,
        order: &order::Model,
        apply: impl FnOnce(&mut order::ActiveModel),
    ) -> Result<order::Model, ServiceError> {
        let mut active: order::ActiveModel = order.clone().into();
        apply(&mut active);
        active.updated_at = Set(Some(Utc::now()));
        Ok(active.update(&*self.db).await?)
    }
}
