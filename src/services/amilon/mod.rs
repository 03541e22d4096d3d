//! Client side of the Amilon B2B voucher API.

pub mod auth;
pub mod catalog;
pub mod client;
pub mod orders;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dto::OrderDto;
use crate::entities::product;
use crate::errors::ServiceError;

pub use auth::AmilonAuthService;
pub use catalog::AmilonCatalogService;
pub use client::AmilonClient;
pub use orders::AmilonOrderService;

pub const PROVIDER: &str = "amilon";
pub const API_VERSION: &str = "v1";

/// Places vendor orders. Purchase and recovery depend on this rather than on
/// the HTTP client so they can run against a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoucherOrderGateway: Send + Sync {
    async fn create_order(
        &self,
        product: &product::Model,
        quantity: i32,
        external_order_id: &str,
        user_id: Option<Uuid>,
        payment_id: Option<String>,
    ) -> Result<OrderDto, ServiceError>;

    async fn get_order_info(&self, external_order_id: &str) -> Result<OrderDto, ServiceError>;
}
