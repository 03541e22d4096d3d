use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::entities::{merchant, product};
use crate::errors::ServiceError;
use crate::{ApiResponse, AppState};

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CatalogQuery {
    /// Ask Amilon even when stored rows are fresh (admins only)
    pub refresh: Option<bool>,
}

impl CatalogQuery {
    fn force_refresh(&self, user: &AuthenticatedUser) -> bool {
        user.is_admin && self.refresh.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CatalogMerchant {
    pub id: Uuid,
    /// Amilon retailer id
    pub merchant_id: String,
    pub name: String,
    pub country: Option<String>,
}

impl From<merchant::Model> for CatalogMerchant {
    fn from(model: merchant::Model) -> Self {
        Self {
            id: model.id,
            merchant_id: model.merchant_id,
            name: model.name,
            country: model.country,
        }
    }
}

/// A purchasable voucher. Prices are in cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub product_code: Option<String>,
    pub name: String,
    pub price: i64,
    pub net_price: i64,
    pub currency: String,
    pub is_available: bool,
}

impl From<product::Model> for CatalogProduct {
    fn from(model: product::Model) -> Self {
        Self {
            id: model.id,
            product_code: model.product_code,
            name: model.name,
            price: model.price,
            net_price: model.net_price,
            currency: model.currency,
            is_available: model.is_available,
        }
    }
}

/// Retailers of the configured Amilon contract
#[utoipa::path(
    get,
    path = "/api/v1/vouchers/merchants",
    summary = "List voucher merchants",
    params(CatalogQuery),
    responses(
        (status = 200, description = "Merchants retrieved", body = ApiResponse<Vec<CatalogMerchant>>),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn list_merchants(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<ApiResponse<Vec<CatalogMerchant>>>, ServiceError> {
    let merchants = state
        .services
        .catalog
        .get_merchants(query.force_refresh(&user))
        .await?;
    Ok(Json(ApiResponse::success(
        merchants.into_iter().map(CatalogMerchant::from).collect(),
    )))
}

/// Voucher products sold by one retailer
#[utoipa::path(
    get,
    path = "/api/v1/vouchers/merchants/{merchant_id}/products",
    summary = "List merchant products",
    params(
        ("merchant_id" = String, Path, description = "Amilon retailer id"),
        CatalogQuery
    ),
    responses(
        (status = 200, description = "Products retrieved", body = ApiResponse<Vec<CatalogProduct>>),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "vouchers"
)]
pub async fn list_products(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(merchant_id): Path<String>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<ApiResponse<Vec<CatalogProduct>>>, ServiceError> {
    let products = state
        .services
        .catalog
        .get_products(&merchant_id, query.force_refresh(&user))
        .await?;
    Ok(Json(ApiResponse::success(
        products.into_iter().map(CatalogProduct::from).collect(),
    )))
}

pub fn catalog_routes() -> Router<AppState> {
    Router::new()
        .route("/merchants", get(list_merchants))
        .route("/merchants/:merchant_id/products", get(list_products))
}
