use chrono::{DateTime, Utc};
use reqwest::Method;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::AmilonClient;
use crate::dto::order::euros_to_cents;
use crate::entities::{merchant, product};
use crate::errors::ServiceError;

/// Counts written by a forced catalogue sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSyncSummary {
    pub merchants: usize,
    pub products: usize,
}

/// Retailers and voucher products of the configured contract.
///
/// Stored rows are served while younger than `catalog_ttl_secs`; past that
/// Amilon is asked again, and any vendor failure falls back to what is stored.
#[derive(Clone)]
pub struct AmilonCatalogService {
    client: AmilonClient,
    db: Arc<DatabaseConnection>,
}

impl AmilonCatalogService {
    pub fn new(client: AmilonClient, db: Arc<DatabaseConnection>) -> Self {
        Self { client, db }
    }

    #[instrument(skip(self))]
    pub async fn get_merchants(
        &self,
        force_refresh: bool,
    ) -> Result<Vec<merchant::Model>, ServiceError> {
        let stored = merchant::Entity::find()
            .order_by_asc(merchant::Column::Name)
            .all(&*self.db)
            .await?;
        if !force_refresh && self.is_fresh(stored.iter().map(|m| m.updated_at.unwrap_or(m.created_at))) {
            return Ok(stored);
        }

        let rows = match self.fetch("retailers").await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, stored = stored.len(), "Serving stored merchants, Amilon retailers unavailable");
                return Ok(stored);
            }
        };

        let mut merchants = self
            .db
            .transaction::<_, Vec<merchant::Model>, ServiceError>(|txn| {
                Box::pin(async move {
                    let mut merchants = Vec::with_capacity(rows.len());
                    for row in rows.iter().filter_map(Value::as_object) {
                        if let Some(model) = upsert_merchant(txn, row).await? {
                            merchants.push(model);
                        }
                    }
                    Ok(merchants)
                })
            })
            .await?;

        merchants.sort_by(|a, b| a.name.cmp(&b.name));

        info!(count = merchants.len(), "Merchants refreshed from Amilon");
        Ok(merchants)
    }

    /// Products of the retailer Amilon knows as `merchant_code`.
    #[instrument(skip(self))]
    pub async fn get_products(
        &self,
        merchant_code: &str,
        force_refresh: bool,
    ) -> Result<Vec<product::Model>, ServiceError> {
        let stored = match merchant::Entity::find()
            .filter(merchant::Column::MerchantId.eq(merchant_code))
            .one(&*self.db)
            .await?
        {
            Some(merchant) => {
                product::Entity::find()
                    .filter(product::Column::MerchantId.eq(merchant.id))
                    .order_by_asc(product::Column::Price)
                    .all(&*self.db)
                    .await?
            }
            None => Vec::new(),
        };
        if !force_refresh && self.is_fresh(stored.iter().map(|p| p.updated_at.unwrap_or(p.created_at))) {
            return Ok(stored);
        }

        let rows = match self.fetch("products/complete").await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, merchant_code, stored = stored.len(), "Serving stored products, Amilon products unavailable");
                return Ok(stored);
            }
        };

        let code = merchant_code.to_string();
        let mut products = self
            .db
            .transaction::<_, Vec<product::Model>, ServiceError>(|txn| {
                Box::pin(async move {
                    let rows: Vec<&Map<String, Value>> = rows
                        .iter()
                        .filter_map(Value::as_object)
                        .filter(|row| string_field(row, "MerchantCode").as_deref() == Some(code.as_str()))
                        .collect();
                    upsert_products(txn, &rows).await
                })
            })
            .await?;
        products.sort_by_key(|p| p.price);

        info!(merchant_code, count = products.len(), "Products refreshed from Amilon");
        Ok(products)
    }

    /// Pulls the whole catalogue. Unlike the readers, vendor failures are returned.
    pub async fn sync(&self) -> Result<CatalogSyncSummary, ServiceError> {
        let retailers = self.fetch("retailers").await?;
        let products = self.fetch("products/complete").await?;

        let summary = self
            .db
            .transaction::<_, CatalogSyncSummary, ServiceError>(|txn| {
                Box::pin(async move {
                    let mut summary = CatalogSyncSummary::default();
                    for row in retailers.iter().filter_map(Value::as_object) {
                        if upsert_merchant(txn, row).await?.is_some() {
                            summary.merchants += 1;
                        }
                    }
                    let rows: Vec<&Map<String, Value>> =
                        products.iter().filter_map(Value::as_object).collect();
                    summary.products = upsert_products(txn, &rows).await?.len();
                    Ok(summary)
                })
            })
            .await?;

        info!(merchants = summary.merchants, products = summary.products, "Amilon catalogue synced");
        Ok(summary)
    }

    fn is_fresh(&self, touched: impl Iterator<Item = DateTime<Utc>>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.client.config().catalog_ttl()) else {
            return false;
        };
        touched
            .min()
            .is_some_and(|oldest| Utc::now() - oldest < ttl)
    }

    /// `GET /contracts/{contract}/{culture}/{resource}`, which answers with a JSON array.
    async fn fetch(&self, resource: &str) -> Result<Vec<Value>, ServiceError> {
        let config = self.client.config();
        let path = format!(
            "/contracts/{}/{}/{resource}",
            config.contract_id, config.culture
        );
        let response = self.client.send_authorized(Method::GET, &path, None).await?;

        if !response.status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "Amilon {resource} request failed with status {}: {}",
                response.status.as_u16(),
                response.body
            )));
        }
        match response.json() {
            Value::Array(rows) => Ok(rows),
            _ => Err(ServiceError::ExternalServiceError(format!(
                "Amilon {resource} response is not a list"
            ))),
        }
    }
}

async fn upsert_merchant<C: ConnectionTrait>(
    conn: &C,
    row: &Map<String, Value>,
) -> Result<Option<merchant::Model>, ServiceError> {
    let (Some(code), Some(name)) = (string_field(row, "RetailerId"), string_field(row, "Name"))
    else {
        return Ok(None);
    };
    let country = string_field(row, "CountryISOAlpha3").or_else(|| string_field(row, "Country"));
    save_merchant(conn, &code, &name, country).await.map(Some)
}

async fn save_merchant<C: ConnectionTrait>(
    conn: &C,
    code: &str,
    name: &str,
    country: Option<String>,
) -> Result<merchant::Model, ServiceError> {
    let now = Utc::now();
    let existing = merchant::Entity::find()
        .filter(merchant::Column::MerchantId.eq(code))
        .one(conn)
        .await?;

    Ok(match existing {
        Some(model) => {
            let mut active: merchant::ActiveModel = model.into();
            active.name = Set(name.to_string());
            if country.is_some() {
                active.country = Set(country);
            }
            active.updated_at = Set(Some(now));
            active.update(conn).await?
        }
        None => {
            merchant::ActiveModel {
                id: Set(Uuid::new_v4()),
                merchant_id: Set(code.to_string()),
                name: Set(name.to_string()),
                country: Set(country),
                created_at: Set(now),
                updated_at: Set(Some(now)),
            }
            .insert(conn)
            .await?
        }
    })
}

/// Upserts products keyed by `ProductCode`, creating unknown retailers from
/// the `Merchant*` fields carried on each row.
async fn upsert_products<C: ConnectionTrait>(
    conn: &C,
    rows: &[&Map<String, Value>],
) -> Result<Vec<product::Model>, ServiceError> {
    let mut merchants: HashMap<String, Uuid> = HashMap::new();
    let mut saved = Vec::with_capacity(rows.len());
    let now = Utc::now();

    for row in rows {
        let Some(code) = string_field(row, "ProductCode") else {
            continue;
        };
        let Some(price) = row.get("Price").and_then(euros_to_cents) else {
            warn!(product_code = %code, "Skipping Amilon product without a price");
            continue;
        };
        let net_price = row.get("NetPrice").and_then(euros_to_cents).unwrap_or(price);
        let name = string_field(row, "Name").unwrap_or_else(|| code.clone());
        let currency = currency_code(string_field(row, "Currency").as_deref());
        let is_available = row.get("Active").and_then(Value::as_bool) != Some(false)
            && row.get("Visible").and_then(Value::as_bool) != Some(false);

        let merchant_id = match string_field(row, "MerchantCode") {
            Some(merchant_code) => match merchants.get(&merchant_code) {
                Some(id) => Some(*id),
                None => {
                    let id = resolve_merchant(conn, row, &merchant_code).await?;
                    if let Some(id) = id {
                        merchants.insert(merchant_code, id);
                    }
                    id
                }
            },
            None => None,
        };

        let existing = product::Entity::find()
            .filter(product::Column::ProductCode.eq(code.as_str()))
            .one(conn)
            .await?;
        let model = match existing {
            Some(model) => {
                let mut active: product::ActiveModel = model.into();
                active.name = Set(name);
                active.price = Set(price);
                active.net_price = Set(net_price);
                active.currency = Set(currency);
                active.is_available = Set(is_available);
                if merchant_id.is_some() {
                    active.merchant_id = Set(merchant_id);
                }
                active.updated_at = Set(Some(now));
                active.update(conn).await?
            }
            None => {
                product::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_code: Set(Some(code)),
                    merchant_id: Set(merchant_id),
                    name: Set(name),
                    price: Set(price),
                    net_price: Set(net_price),
                    currency: Set(currency),
                    is_available: Set(is_available),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(conn)
                .await?
            }
        };
        saved.push(model);
    }

    Ok(saved)
}

async fn resolve_merchant<C: ConnectionTrait>(
    conn: &C,
    row: &Map<String, Value>,
    merchant_code: &str,
) -> Result<Option<Uuid>, ServiceError> {
    if let Some(known) = merchant::Entity::find()
        .filter(merchant::Column::MerchantId.eq(merchant_code))
        .one(conn)
        .await?
    {
        return Ok(Some(known.id));
    }
    let Some(name) = string_field(row, "MerchantName") else {
        return Ok(None);
    };
    let country = string_field(row, "MerchantCountryISOAlpha3")
        .or_else(|| string_field(row, "MerchantCountry"));
    let merchant = save_merchant(conn, merchant_code, &name, country).await?;
    Ok(Some(merchant.id))
}

fn string_field(row: &Map<String, Value>, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Amilon spells the currency out ("Euro").
fn currency_code(raw: Option<&str>) -> String {
    match raw.map(|c| c.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("euro") | Some("eur") => "EUR".to_string(),
        Some(other) => other.to_ascii_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::amilon::AmilonAuthService;
    use crate::services::test_support::{amilon_config, memory_db};
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RETAILERS: &str = "/b2bwebapi/v1/contracts/contract-1/pt-PT/retailers";
    const PRODUCTS: &str = "/b2bwebapi/v1/contracts/contract-1/pt-PT/products/complete";

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 300})),
            )
            .mount(server)
            .await;
    }

    async fn catalog(server: &MockServer) -> (AmilonCatalogService, Arc<DatabaseConnection>) {
        let db = Arc::new(memory_db().await);
        let config = amilon_config(&server.uri());
        let auth = Arc::new(AmilonAuthService::new(config.clone()));
        (
            AmilonCatalogService::new(AmilonClient::new(auth, config), db.clone()),
            db,
        )
    }

    fn retailers() -> Value {
        json!([
            {"RetailerId": "R-DECATHLON", "Name": "Decathlon", "Country": "Italy", "CountryISOAlpha3": "ITA"},
            {"RetailerId": "R-TRONY", "Name": "Trony", "CountryISOAlpha3": "ITA"},
            {"Name": "No id, skipped"}
        ])
    }

    fn products() -> Value {
        json!([
            {
                "ProductCode": "P-70", "Currency": "Euro", "MerchantCode": "R-DECATHLON",
                "MerchantName": "Decathlon", "MerchantCountryISOAlpha3": "ITA",
                "Name": "Decathlon - Gift Card 70 €", "Price": 70.0, "NetPrice": 69.3,
                "Active": true, "Visible": true
            },
            {
                "ProductCode": "P-25", "MerchantCode": "R-DECATHLON", "MerchantName": "Decathlon",
                "Name": "Decathlon - Gift Card 25 €", "Price": 25.0, "Visible": false
            },
            {
                "ProductCode": "P-OTHER", "MerchantCode": "R-FNAC", "MerchantName": "Fnac",
                "Name": "Fnac 50", "Price": 50.0, "NetPrice": 48.5
            }
        ])
    }

    async fn insert_merchant(db: &DatabaseConnection, code: &str, touched: DateTime<Utc>) {
        merchant::ActiveModel {
            id: Set(Uuid::new_v4()),
            merchant_id: Set(code.to_string()),
            name: Set(format!("Stored {code}")),
            country: Set(Some("PRT".into())),
            created_at: Set(touched),
            updated_at: Set(Some(touched)),
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn loads_merchants_once_then_serves_them_from_storage() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(200).set_body_json(retailers()))
            .expect(1)
            .mount(&server)
            .await;

        let (svc, _db) = catalog(&server).await;
        let merchants = svc.get_merchants(false).await.unwrap();
        assert_eq!(merchants.len(), 2);
        assert_eq!(merchants[0].merchant_id, "R-DECATHLON");
        assert_eq!(merchants[0].country.as_deref(), Some("ITA"));

        let again = svc.get_merchants(false).await.unwrap();
        let names: Vec<_> = again.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Decathlon", "Trony"]);
    }

    #[tokio::test]
    async fn stale_merchants_are_refreshed_in_place() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(200).set_body_json(retailers()))
            .expect(1)
            .mount(&server)
            .await;

        let (svc, db) = catalog(&server).await;
        insert_merchant(&db, "R-TRONY", Utc::now() - chrono::Duration::days(2)).await;

        svc.get_merchants(false).await.unwrap();
        let stored = merchant::Entity::find()
            .filter(merchant::Column::MerchantId.eq("R-TRONY"))
            .all(&*db)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Trony");
        assert_eq!(stored[0].country.as_deref(), Some("ITA"));
    }

    #[tokio::test]
    async fn vendor_failure_falls_back_to_stored_merchants() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&server)
            .await;

        let (svc, db) = catalog(&server).await;
        insert_merchant(&db, "R-STORED", Utc::now()).await;

        let merchants = svc.get_merchants(true).await.unwrap();
        assert_eq!(merchants.len(), 1);
        assert_eq!(merchants[0].merchant_id, "R-STORED");
    }

    #[tokio::test]
    async fn retailers_retry_once_with_a_fresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 300})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(200).set_body_json(retailers()))
            .expect(1)
            .mount(&server)
            .await;

        let (svc, _db) = catalog(&server).await;
        assert_eq!(svc.get_merchants(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn products_are_filtered_by_merchant_and_priced_in_cents() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path(PRODUCTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(products()))
            .expect(1)
            .mount(&server)
            .await;

        let (svc, db) = catalog(&server).await;
        let products = svc.get_products("R-DECATHLON", false).await.unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].product_code.as_deref(), Some("P-25"));
        assert_eq!(products[0].net_price, 2_500);
        assert!(!products[0].is_available);
        assert_eq!(products[1].price, 7_000);
        assert_eq!(products[1].net_price, 6_930);
        assert_eq!(products[1].currency, "EUR");
        assert!(products[1].is_available);

        let merchant = merchant::Entity::find()
            .filter(merchant::Column::MerchantId.eq("R-DECATHLON"))
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(products[1].merchant_id, Some(merchant.id));
        assert_eq!(merchant.country.as_deref(), Some("ITA"));

        // served from storage now
        assert_eq!(svc.get_products("R-DECATHLON", false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sync_reports_what_was_written_and_surfaces_vendor_errors() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path(RETAILERS))
            .respond_with(ResponseTemplate::new(200).set_body_json(retailers()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(products()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "busy"})))
            .mount(&server)
            .await;

        let (svc, db) = catalog(&server).await;
        let summary = svc.sync().await.unwrap();
        assert_eq!(summary, CatalogSyncSummary { merchants: 2, products: 3 });
        // Fnac came in through its product row
        assert_eq!(merchant::Entity::find().all(&*db).await.unwrap().len(), 3);

        assert_matches!(svc.sync().await, Err(ServiceError::ExternalServiceError(_)));
    }

    #[test]
    fn currency_names_map_to_iso_codes() {
        assert_eq!(currency_code(Some("Euro")), "EUR");
        assert_eq!(currency_code(None), "EUR");
        assert_eq!(currency_code(Some("gbp")), "GBP");
    }
}
