use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle of a voucher order.
///
/// `pending -> confirmed | error`, `error -> confirmed` after a successful
/// recovery and `error -> cancelled` once recovery gives up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "error")]
    Error,
}

impl OrderStatus {
    /// Maps the free-form status reported by Amilon. Unknown or missing values stay pending.
    pub fn from_amilon_status(status: Option<&str>) -> Self {
        let Some(raw) = status else {
            return Self::Pending;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "delivered" | "confirmed" | "success" | "successful" => Self::Confirmed,
            "cancelled" | "canceled" | "refunded" => Self::Cancelled,
            "error" | "failed" | "rejected" => Self::Error,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "balance")]
    Balance,
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "mixed")]
    Mixed,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Stripe => "stripe",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Our id, sent to Amilon as `externalOrderId`
    #[sea_orm(unique)]
    pub external_order_id: String,
    /// Amilon's own order id
    pub order_id: Option<String>,

    pub user_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub merchant_id: Option<Uuid>,

    pub amount: i64,
    pub total_amount: Option<i64>,
    pub price_paid: Option<i64>,
    pub status: OrderStatus,
    /// Raw status string last reported by Amilon
    pub order_status: Option<String>,

    pub payment_method: Option<PaymentMethod>,
    pub payment_id: Option<String>,
    pub stripe_payment_id: Option<String>,
    pub balance_amount_used: i64,

    pub product_name: Option<String>,
    pub voucher_code: Option<String>,
    pub voucher_pin: Option<String>,
    pub voucher_url: Option<String>,
    pub order_date: Option<DateTime<Utc>>,
    pub gross_amount: Option<i64>,
    pub net_amount: Option<i64>,
    pub total_requested_codes: Option<i32>,
    pub currency: String,

    pub recovery_attempts: i32,
    pub last_error: Option<String>,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    pub order_recovered_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Looks an order up by primary key, falling back to `external_order_id`.
pub async fn find_by_identifier<C: ConnectionTrait>(
    conn: &C,
    identifier: &str,
) -> Result<Option<Model>, DbErr> {
    if let Ok(id) = Uuid::parse_str(identifier) {
        if let Some(order) = Entity::find_by_id(id).one(conn).await? {
            return Ok(Some(order));
        }
    }
    Entity::find()
        .filter(Column::ExternalOrderId.eq(identifier))
        .one(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("Completed"), OrderStatus::Confirmed)]
    #[case(Some("delivered"), OrderStatus::Confirmed)]
    #[case(Some("SUCCESSFUL"), OrderStatus::Confirmed)]
    #[case(Some("canceled"), OrderStatus::Cancelled)]
    #[case(Some("refunded"), OrderStatus::Cancelled)]
    #[case(Some("Rejected"), OrderStatus::Error)]
    #[case(Some("failed"), OrderStatus::Error)]
    #[case(Some("processing"), OrderStatus::Pending)]
    #[case(Some(""), OrderStatus::Pending)]
    #[case(None, OrderStatus::Pending)]
    fn maps_amilon_statuses(#[case] raw: Option<&str>, #[case] expected: OrderStatus) {
        assert_eq!(OrderStatus::from_amilon_status(raw), expected);
    }
}
