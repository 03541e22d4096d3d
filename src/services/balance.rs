use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::credit_balance::{self, Entity as CreditBalanceEntity, CASH};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Outcome of a successful balance debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentResult {
    pub amount_debited: i64,
    pub remaining_balance: i64,
    pub transaction_id: Uuid,
}

/// Pays voucher orders out of the user's cash credit.
#[derive(Clone)]
pub struct BalancePaymentService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
}

impl BalancePaymentService {
    pub fn new(db: Arc<DatabaseConnection>, events: EventSender) -> Self {
        Self { db, events }
    }

    /// Current cash balance in cents, zero when the user has none.
    pub async fn balance(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        Ok(find_balance(&*self.db, user_id, CASH, false)
            .await?
            .map(|row| row.balance)
            .unwrap_or(0))
    }

    /// Debits `amount` cents for `order_id` under a row lock.
    #[instrument(skip(self))]
    pub async fn process_payment(
        &self,
        user_id: Uuid,
        amount: i64,
        order_id: Uuid,
    ) -> Result<PaymentResult, ServiceError> {
        if amount <= 0 {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".into(),
            ));
        }

        let remaining_balance = self
            .db
            .transaction::<_, i64, ServiceError>(|txn| {
                Box::pin(async move { debit(txn, user_id, CASH, amount).await })
            })
            .await?;

        let transaction_id = Uuid::new_v4();
        info!(
            %user_id,
            %order_id,
            amount,
            remaining_balance,
            %transaction_id,
            "Balance debited for voucher order"
        );

        self.events
            .send_or_log(Event::BalanceDebited {
                user_id,
                amount,
                order_id,
            })
            .await;

        Ok(PaymentResult {
            amount_debited: amount,
            remaining_balance,
            transaction_id,
        })
    }

    /// Gives `amount` cents of cash credit back to the user. Returns the new balance.
    #[instrument(skip(self))]
    pub async fn refund(&self, user_id: Uuid, amount: i64, reason: &str) -> Result<i64, ServiceError> {
        let reason = reason.to_string();
        let balance = self
            .db
            .transaction::<_, i64, ServiceError>(|txn| {
                Box::pin(async move { add_credit(txn, user_id, CASH, amount, &reason).await })
            })
            .await?;

        self.events
            .send_or_log(Event::BalanceCredited {
                user_id,
                amount,
                credit_type: CASH.to_string(),
            })
            .await;

        Ok(balance)
    }
}

async fn find_balance<C: ConnectionTrait>(
    conn: &C,
    owner_id: Uuid,
    credit_type: &str,
    for_update: bool,
) -> Result<Option<credit_balance::Model>, ServiceError> {
    let mut query = CreditBalanceEntity::find()
        .filter(credit_balance::Column::OwnerId.eq(owner_id))
        .filter(credit_balance::Column::CreditType.eq(credit_type));
    if for_update {
        query = query.lock_exclusive();
    }
    Ok(query.one(conn).await?)
}

/// Removes `amount` cents from the owner's `credit_type` balance and returns what is left.
///
/// Must run inside a transaction for the lock to hold.
pub async fn debit<C: ConnectionTrait>(
    conn: &C,
    owner_id: Uuid,
    credit_type: &str,
    amount: i64,
) -> Result<i64, ServiceError> {
    let row = find_balance(conn, owner_id, credit_type, true).await?;
    let available = row.as_ref().map(|r| r.balance).unwrap_or(0);

    let Some(row) = row.filter(|r| r.balance >= amount) else {
        warn!(%owner_id, available, required = amount, "Insufficient balance");
        return Err(ServiceError::InsufficientBalance(format!(
            "available {available} cents, required {amount} cents"
        )));
    };

    let remaining = row.balance - amount;
    let mut active: credit_balance::ActiveModel = row.into();
    active.balance = Set(remaining);
    active.updated_at = Set(Some(Utc::now()));
    active.update(conn).await?;

    Ok(remaining)
}

/// Adds credit, creating the balance row on first use. Returns the new balance.
pub async fn add_credit<C: ConnectionTrait>(
    conn: &C,
    owner_id: Uuid,
    credit_type: &str,
    amount: i64,
    reason: &str,
) -> Result<i64, ServiceError> {
    if amount < 0 {
        return Err(ServiceError::ValidationError(
            "Credit amount cannot be negative".into(),
        ));
    }

    let now = Utc::now();
    let balance = match find_balance(conn, owner_id, credit_type, true).await? {
        Some(row) => {
            let balance = row.balance + amount;
            let mut active: credit_balance::ActiveModel = row.into();
            active.balance = Set(balance);
            active.updated_at = Set(Some(now));
            active.update(conn).await?;
            balance
        }
        None => {
            credit_balance::ActiveModel {
                id: Set(Uuid::new_v4()),
                owner_id: Set(owner_id),
                credit_type: Set(credit_type.to_string()),
                balance: Set(amount),
                created_at: Set(now),
                updated_at: Set(Some(now)),
            }
            .insert(conn)
            .await?;
            amount
        }
    };

    info!(%owner_id, credit_type, amount, balance, reason, "Credit added");
    Ok(balance)
}
