use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub const FALLBACK_CURRENCY: &str = "USD";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotItem {
    pub title: String,
    pub qty: i64,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
}

/// Canonical summary of an archived order. Derived, never authoritative:
/// callers rebuild it from the raw order document whenever they need it
/// instead of trusting a stored copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub items: Vec<SnapshotItem>,
    pub total: f64,
    pub currency: String,
    pub delivered_at: DateTime<Utc>,
}

/// Normalizes a loosely-typed order document into an `OrderSnapshot`.
/// Pure and deterministic given the same document and `now`; never fails.
/// Each field is resolved by trying a fixed list of legacy shapes in
/// priority order.
pub fn build_snapshot(order: &Value, now: DateTime<Utc>) -> OrderSnapshot {
    let items = extract_items(order);
    let total = extract_total(order, &items);
    let currency = extract_currency(order);
    let delivered_at = extract_delivered_at(order, now);

    OrderSnapshot {
        items,
        total,
        currency,
        delivered_at,
    }
}

fn extract_items(order: &Value) -> Vec<SnapshotItem> {
    let candidates = [
        order.pointer("/snapshot/items"),
        order.get("cart"),
        order.get("items"),
    ];

    let raw_items = candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .find(|list| !list.is_empty());

    let Some(raw_items) = raw_items else {
        return Vec::new();
    };

    raw_items.iter().filter_map(normalize_item).collect()
}

// Items without a usable title are dropped rather than failing the order.
fn normalize_item(raw: &Value) -> Option<SnapshotItem> {
    let title = first_string(raw, &["title", "name"])?;
    let qty = item_qty(raw);
    let price = item_price(raw, qty);
    let vendor_name =
        first_string(raw, &["vendorName"]).or_else(|| string_at(raw, "/vendor/name"));

    Some(SnapshotItem {
        title,
        qty,
        price,
        vendor_name,
    })
}

fn item_qty(raw: &Value) -> i64 {
    if let Some(qty) = first_number(raw, &["qty", "quantity"]) {
        return qty as i64;
    }

    let bulk = first_number(raw, &["bulkQty"]);
    let detail = first_number(raw, &["detailQty"]);

    if bulk.is_some() || detail.is_some() {
        return (bulk.unwrap_or(0.0) + detail.unwrap_or(0.0)) as i64;
    }

    1
}

fn item_price(raw: &Value, qty: i64) -> f64 {
    if qty > 0 {
        if let Some(line_total) = first_number(raw, &["totalAmount", "lineTotal"]) {
            return line_total / qty as f64;
        }
    }

    first_number(raw, &["price", "unitPrice"]).unwrap_or(0.0)
}

fn extract_total(order: &Value, items: &[SnapshotItem]) -> f64 {
    first_number(order, &["total", "totalAmount"])
        .unwrap_or_else(|| items.iter().map(|item| item.qty as f64 * item.price).sum())
}

fn extract_currency(order: &Value) -> String {
    first_string(order, &["currency"])
        .or_else(|| string_at(order, "/snapshot/currency"))
        .unwrap_or_else(|| String::from(FALLBACK_CURRENCY))
}

fn extract_delivered_at(order: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
    let candidates = [
        order.pointer("/snapshot/deliveredAt"),
        order.get("deliveredAt"),
        order.get("timestamp"),
        order.get("createdAt"),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(parse_timestamp)
        .unwrap_or(now)
}

// Accepts RFC 3339 strings and epoch milliseconds, the two forms the
// legacy archive actually contains.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(text) = value.as_str() {
        return DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc));
    }

    value
        .as_i64()
        .and_then(|millis| DateTime::from_timestamp_millis(millis))
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(String::from)
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(String::from)
}

// Legacy documents sometimes carry numbers as strings.
fn first_number(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|key| value.get(key)).find_map(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|text| text.trim().parse().ok()))
    })
}
