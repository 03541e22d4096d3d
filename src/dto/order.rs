use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{order, order_item, product};

const VOUCHER_CODE_KEYS: [&str; 3] = ["CardCode", "cardCode", "card_code"];
const VOUCHER_PIN_KEYS: [&str; 2] = ["Pin", "pin"];
const VOUCHER_URL_KEYS: [&str; 3] = ["VoucherLink", "voucherLink", "voucher_link"];
const RETAILER_NAME_KEYS: [&str; 3] = ["RetailerName", "retailerName", "retailer_name"];
const VOUCHER_PRODUCT_KEYS: [&str; 3] = ["ProductId", "productId", "product_id"];

/// One order row as Amilon reports it, keyed by Amilon product id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderItemDto {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub vouchers: Vec<Value>,
}

impl OrderItemDto {
    fn from_row(row: &Map<String, Value>, product: &product::Model) -> Self {
        let product_id = pick(row, &["productId", "ProductId", "product_id"])
            .and_then(as_string)
            .or_else(|| product.product_code.clone())
            .unwrap_or_default();
        let quantity = pick(row, &["quantity", "Quantity"])
            .and_then(as_i64)
            .and_then(|q| i32::try_from(q).ok())
            .unwrap_or(1);
        let vouchers = vouchers_of(row).cloned().unwrap_or_default();

        Self {
            product_id,
            quantity,
            vouchers,
        }
    }
}

/// Normalised view of an Amilon order, built from a vendor response or a stored order.
///
/// Money fields are integer cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderDto {
    pub merchant_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub amount: i64,
    pub external_order_id: String,
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub price_paid: Option<i64>,
    pub voucher_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub payment_id: Option<String>,
    pub items: Vec<OrderItemDto>,
    pub order_date: Option<DateTime<Utc>>,
    pub gross_amount: Option<i64>,
    pub net_amount: Option<i64>,
    pub total_requested_codes: Option<i32>,
    pub order_status: Option<String>,
    pub voucher_code: Option<String>,
    pub voucher_pin: Option<String>,
    pub product_name: Option<String>,
    pub currency: String,
}

impl OrderDto {
    /// Maps the body returned by `Orders/create` (or `Orders/{id}/complete`).
    ///
    /// Amilon is inconsistent about key casing, so every field is looked up under
    /// each spelling it has been seen with. Garbage values become `None`.
    pub fn from_api_response(
        response: &Value,
        product: &product::Model,
        amount_cents: i64,
        external_order_id: &str,
        payment_id: Option<&str>,
    ) -> Self {
        let empty = Map::new();
        let body = response.as_object().unwrap_or(&empty);

        let mut items: Vec<OrderItemDto> = body
            .get("orderRows")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_object)
                    .map(|row| OrderItemDto::from_row(row, product))
                    .collect()
            })
            .unwrap_or_default();

        let mut voucher_code = None;
        let mut voucher_pin = None;
        let mut voucher_url = None;
        let mut product_name = None;
        let mut total_requested_codes = None;

        if let Some(vouchers) = vouchers_of(body) {
            total_requested_codes = i32::try_from(vouchers.len()).ok();

            if let Some(first) = vouchers.first().and_then(Value::as_object) {
                voucher_code = pick(first, &VOUCHER_CODE_KEYS).and_then(as_string);
                voucher_pin = pick(first, &VOUCHER_PIN_KEYS).and_then(as_string);
                voucher_url = pick(first, &VOUCHER_URL_KEYS).and_then(as_string);
                product_name = pick(first, &RETAILER_NAME_KEYS).and_then(as_string);
            }

            let mut by_product: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            let mut first_seen: Vec<String> = Vec::new();
            for voucher in vouchers {
                let Some(obj) = voucher.as_object() else {
                    continue;
                };
                let key = pick(obj, &VOUCHER_PRODUCT_KEYS)
                    .and_then(as_string)
                    .unwrap_or_default();
                if !by_product.contains_key(&key) {
                    first_seen.push(key.clone());
                }
                by_product.entry(key).or_default().push(voucher.clone());
            }

            if items.is_empty() {
                items = first_seen
                    .into_iter()
                    .filter_map(|key| {
                        let vouchers = by_product.remove(&key)?;
                        Some(OrderItemDto {
                            product_id: if key.is_empty() {
                                product.product_code.clone().unwrap_or_default()
                            } else {
                                key
                            },
                            quantity: i32::try_from(vouchers.len()).unwrap_or(i32::MAX),
                            vouchers,
                        })
                    })
                    .collect();
            } else {
                for item in items.iter_mut() {
                    if let Some(vouchers) = by_product.get(&item.product_id) {
                        item.vouchers = vouchers.clone();
                    }
                }
            }
        }

        let total_requested_codes = total_requested_codes.or_else(|| {
            pick(body, &["totalRequestedCodes", "total_requested_codes"])
                .and_then(as_i64)
                .and_then(|n| i32::try_from(n).ok())
        });

        let status = pick(body, &["orderStatus", "status"]).and_then(as_string);
        let order_status = pick(body, &["orderStatus", "order_status"]).and_then(as_string);

        Self {
            merchant_id: product.merchant_id,
            product_id: Some(product.id),
            amount: amount_cents,
            external_order_id: external_order_id.to_string(),
            order_id: pick(body, &["order_id", "orderId"]).and_then(as_string),
            status,
            price_paid: Some(product.net_price),
            voucher_url: voucher_url
                .or_else(|| pick(body, &["voucher_url"]).and_then(as_string)),
            created_at: Utc::now(),
            payment_id: payment_id.map(str::to_string),
            items,
            order_date: pick(body, &["OrderDate", "orderDate", "order_date"])
                .and_then(as_string)
                .and_then(|raw| parse_vendor_date(&raw)),
            gross_amount: pick(body, &["grossAmount", "gross_amount"]).and_then(euros_to_cents),
            net_amount: pick(body, &["netAmount", "net_amount"]).and_then(euros_to_cents),
            total_requested_codes,
            order_status,
            voucher_code,
            voucher_pin,
            product_name,
            currency: "EUR".to_string(),
        }
    }

    /// Rebuilds the DTO from what is stored locally.
    pub fn from_model(order: &order::Model, items: &[order_item::Model]) -> Self {
        Self {
            merchant_id: order.merchant_id,
            product_id: order.product_id,
            amount: order.amount,
            external_order_id: order.external_order_id.clone(),
            order_id: order.order_id.clone(),
            status: Some(order.status.as_str().to_string()),
            price_paid: order.price_paid,
            voucher_url: order.voucher_url.clone(),
            created_at: order.created_at,
            payment_id: order.payment_id.clone(),
            items: items
                .iter()
                .map(|item| OrderItemDto {
                    product_id: item.product_code.clone().unwrap_or_default(),
                    quantity: item.quantity,
                    vouchers: item
                        .vouchers
                        .as_ref()
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect(),
            order_date: order.order_date,
            gross_amount: order.gross_amount,
            net_amount: order.net_amount,
            total_requested_codes: order.total_requested_codes,
            order_status: order.order_status.clone(),
            voucher_code: order.voucher_code.clone(),
            voucher_pin: order.voucher_pin.clone(),
            product_name: order.product_name.clone(),
            currency: order.currency.clone(),
        }
    }

    /// `(code, url)` of the first voucher attached to any item.
    pub fn first_voucher(&self) -> Option<(Option<String>, Option<String>)> {
        self.items
            .iter()
            .find_map(|item| item.vouchers.first())
            .and_then(Value::as_object)
            .map(|voucher| {
                let code = pick(voucher, &VOUCHER_CODE_KEYS)
                    .or_else(|| voucher.get("code"))
                    .and_then(as_string);
                let url = pick(voucher, &VOUCHER_URL_KEYS)
                    .or_else(|| voucher.get("url"))
                    .and_then(as_string);
                (code, url)
            })
    }
}

/// Answer of `get_order_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderStatusSummary {
    pub status: String,
    pub voucher_code: Option<String>,
    pub voucher_url: Option<String>,
    /// Amilon does not report an expiry yet
    pub expires_at: Option<DateTime<Utc>>,
}

/// Vouchers array under any casing of the `vouchers` key.
fn vouchers_of(obj: &Map<String, Value>) -> Option<&Vec<Value>> {
    obj.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("vouchers"))
        .and_then(|(_, value)| value.as_array())
}

fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| Decimal::from_str(trimmed).ok().and_then(|d| d.trunc().to_i64()))
        }
        _ => None,
    }
}

/// Euro amount (number or numeric string) to cents, rounding half away from zero.
pub fn euros_to_cents(value: &Value) -> Option<i64> {
    let decimal = match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok()?,
        Value::String(s) => Decimal::from_str(s.trim()).ok()?,
        _ => return None,
    };
    (decimal * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

fn parse_vendor_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            product_code: Some("AMZ-50".into()),
            merchant_id: Some(Uuid::new_v4()),
            name: "Amazon 50".into(),
            price: 5000,
            net_price: 4750,
            currency: "EUR".into(),
            is_available: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn maps_first_voucher_and_groups_by_product_when_no_rows() {
        let product = product();
        let response = json!({
            "orderId": "AM-991",
            "orderStatus": "Completed",
            "OrderDate": "2025-03-04T10:11:12",
            "grossAmount": 50.005,
            "netAmount": "47.5",
            "Vouchers": [
                {"CardCode": "CODE-1", "Pin": "1111", "VoucherLink": "https://v/1", "RetailerName": "Amazon", "ProductId": "AMZ-50"},
                {"cardCode": "CODE-2", "productId": "AMZ-50"},
                {"card_code": "CODE-3", "product_id": "ZAL-20"}
            ]
        });

        let dto = OrderDto::from_api_response(&response, &product, 4750, "ENGAGE-X", Some("pi_1"));

        assert_eq!(dto.order_id.as_deref(), Some("AM-991"));
        assert_eq!(dto.status.as_deref(), Some("Completed"));
        assert_eq!(dto.order_status.as_deref(), Some("Completed"));
        assert_eq!(dto.voucher_code.as_deref(), Some("CODE-1"));
        assert_eq!(dto.voucher_pin.as_deref(), Some("1111"));
        assert_eq!(dto.voucher_url.as_deref(), Some("https://v/1"));
        assert_eq!(dto.product_name.as_deref(), Some("Amazon"));
        assert_eq!(dto.total_requested_codes, Some(3));
        assert_eq!(dto.gross_amount, Some(5001));
        assert_eq!(dto.net_amount, Some(4750));
        assert_eq!(dto.amount, 4750);
        assert_eq!(dto.price_paid, Some(4750));
        assert_eq!(dto.payment_id.as_deref(), Some("pi_1"));
        assert_eq!(dto.currency, "EUR");
        assert!(dto.order_date.is_some());

        assert_eq!(dto.items.len(), 2);
        assert_eq!(dto.items[0].product_id, "AMZ-50");
        assert_eq!(dto.items[0].quantity, 2);
        assert_eq!(dto.items[1].product_id, "ZAL-20");
        assert_eq!(dto.items[1].vouchers.len(), 1);
    }

    #[test]
    fn attaches_vouchers_to_matching_rows() {
        let product = product();
        let response = json!({
            "status": "Pending",
            "orderRows": [
                {"productId": "AMZ-50", "quantity": "2"},
                {"productId": "OTHER", "quantity": 1}
            ],
            "vouchers": [
                {"CardCode": "A", "ProductId": "AMZ-50"},
                {"CardCode": "B", "ProductId": "AMZ-50"}
            ]
        });

        let dto = OrderDto::from_api_response(&response, &product, 4750, "ENGAGE-Y", None);

        assert_eq!(dto.status.as_deref(), Some("Pending"));
        assert_eq!(dto.order_status, None);
        assert_eq!(dto.items.len(), 2);
        assert_eq!(dto.items[0].quantity, 2);
        assert_eq!(dto.items[0].vouchers.len(), 2);
        assert!(dto.items[1].vouchers.is_empty());
    }

    #[test]
    fn tolerates_empty_and_garbage_bodies() {
        let product = product();
        let dto = OrderDto::from_api_response(
            &json!({"grossAmount": "n/a", "orderDate": 12, "vouchers": "nope"}),
            &product,
            100,
            "ENGAGE-Z",
            None,
        );
        assert_eq!(dto.gross_amount, None);
        assert_eq!(dto.order_date, None);
        assert_eq!(dto.total_requested_codes, None);
        assert!(dto.items.is_empty());

        let dto = OrderDto::from_api_response(&Value::Null, &product, 100, "ENGAGE-Z", None);
        assert_eq!(dto.external_order_id, "ENGAGE-Z");
        assert_eq!(dto.status, None);
    }

    #[test]
    fn euro_conversion_rounds_half_away_from_zero() {
        assert_eq!(euros_to_cents(&json!(10.005)), Some(1001));
        assert_eq!(euros_to_cents(&json!("-0.125")), Some(-13));
        assert_eq!(euros_to_cents(&json!(25)), Some(2500));
        assert_eq!(euros_to_cents(&json!(null)), None);
    }

    #[test]
    fn first_voucher_reads_any_casing() {
        let dto = OrderDto {
            items: vec![OrderItemDto {
                product_id: "AMZ-50".into(),
                quantity: 1,
                vouchers: vec![json!({"cardCode": "C-9", "voucher_link": "https://v/9"})],
            }],
            ..OrderDto::from_api_response(&json!({}), &product(), 0, "E", None)
        };
        assert_eq!(
            dto.first_voucher(),
            Some((Some("C-9".into()), Some("https://v/9".into())))
        );
    }
}
