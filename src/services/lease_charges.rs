use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::AppResult;
use crate::repository::table_service::{count_rows, create_row, get_row};
use crate::schemas::remove_nulls;
use crate::services::billing_period::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeKind {
    Rent,
    Fee,
}

impl ChargeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::Fee => "fee",
        }
    }
}

/// Create the charge for `(lease, kind, period)` unless one already exists.
///
/// Returns `Ok(None)` when the lease is already billed for the period. Any
/// database error propagates — charge creation is the record-of-truth
/// operation, so the caller must not paper over a partial failure.
///
/// Not safe against two concurrent calls for the *same* lease; the billing
/// run processes each lease exactly once per invocation.
pub async fn create_charge_for_period(
    pool: &PgPool,
    lease: &Value,
    kind: ChargeKind,
    period: BillingPeriod,
) -> AppResult<Option<Value>> {
    let lease_id = value_str(lease, "id");

    let existing = count_rows(
        pool,
        "lease_charges",
        Some(&existing_charge_filters(&lease_id, kind, period)),
    )
    .await?;
    if existing > 0 {
        tracing::debug!(
            lease_id,
            kind = kind.as_str(),
            month = period.month(),
            year = period.year(),
            "Charge already exists for this period, skipping"
        );
        return Ok(None);
    }

    let property_id = resolve_property_id(pool, lease).await?;
    let due_date = period.due_date(billing_day(lease));
    let payload = remove_nulls(build_charge_payload(
        lease,
        kind,
        &due_date.to_string(),
        property_id.as_deref(),
    ));

    let created = create_row(pool, "lease_charges", &payload).await?;
    Ok(Some(created))
}

/// Half-open period window over `due_date`: `[first day, next first day)`.
fn existing_charge_filters(lease_id: &str, kind: ChargeKind, period: BillingPeriod) -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), Value::String(lease_id.to_string()));
    filters.insert(
        "kind".to_string(),
        Value::String(kind.as_str().to_string()),
    );
    filters.insert(
        "due_date__gte".to_string(),
        Value::String(period.first_day().to_string()),
    );
    filters.insert(
        "due_date__lt".to_string(),
        Value::String(period.next_first_day().to_string()),
    );
    filters
}

/// A lease may target a unit; the unit may belong to a property. Either
/// link may legitimately be absent.
async fn resolve_property_id(pool: &PgPool, lease: &Value) -> AppResult<Option<String>> {
    let unit_id = value_str(lease, "unit_id");
    if unit_id.is_empty() {
        return Ok(None);
    }
    let unit = get_row(pool, "units", &unit_id, "id").await?;
    let property_id = value_str(&unit, "property_id");
    Ok(if property_id.is_empty() {
        None
    } else {
        Some(property_id)
    })
}

fn build_charge_payload(
    lease: &Value,
    kind: ChargeKind,
    due_date: &str,
    property_id: Option<&str>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "organization_id".to_string(),
        Value::String(value_str(lease, "organization_id")),
    );
    payload.insert("lease_id".to_string(), Value::String(value_str(lease, "id")));
    payload.insert(
        "kind".to_string(),
        Value::String(kind.as_str().to_string()),
    );
    payload.insert("status".to_string(), Value::String("pending".to_string()));
    payload.insert("due_date".to_string(), Value::String(due_date.to_string()));
    payload.insert(
        "amount".to_string(),
        lease
            .as_object()
            .and_then(|obj| obj.get("monthly_rent"))
            .cloned()
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "currency".to_string(),
        lease
            .as_object()
            .and_then(|obj| obj.get("currency"))
            .cloned()
            .unwrap_or_else(|| Value::String("USD".to_string())),
    );

    let unit_id = value_str(lease, "unit_id");
    if !unit_id.is_empty() {
        payload.insert("unit_id".to_string(), Value::String(unit_id));
    }
    if let Some(property_id) = property_id {
        payload.insert(
            "property_id".to_string(),
            Value::String(property_id.to_string()),
        );
    }

    payload
}

/// Preferred billing day-of-month from the lease, normalized into 1..=31.
fn billing_day(lease: &Value) -> u32 {
    lease
        .as_object()
        .and_then(|obj| obj.get("billing_day_of_month"))
        .and_then(Value::as_i64)
        .map(|day| day.clamp(1, 31) as u32)
        .unwrap_or(1)
}

pub(crate) fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{billing_day, build_charge_payload, existing_charge_filters, ChargeKind};
    use crate::services::billing_period::BillingPeriod;

    fn lease() -> Value {
        json!({
            "id": "lease-1",
            "organization_id": "org-1",
            "unit_id": "unit-1",
            "monthly_rent": 1450.0,
            "currency": "USD",
            "billing_day_of_month": 5,
            "lease_status": "active"
        })
    }

    #[test]
    fn period_filters_span_the_month_window() {
        let period = BillingPeriod::new(3, 2024).expect("valid period");
        let filters = existing_charge_filters("lease-1", ChargeKind::Rent, period);

        assert_eq!(filters["lease_id"], json!("lease-1"));
        assert_eq!(filters["kind"], json!("rent"));
        assert_eq!(filters["due_date__gte"], json!("2024-03-01"));
        assert_eq!(filters["due_date__lt"], json!("2024-04-01"));
    }

    #[test]
    fn charge_payload_carries_lease_fields_and_linkage() {
        let payload =
            build_charge_payload(&lease(), ChargeKind::Rent, "2024-03-05", Some("prop-1"));

        assert_eq!(payload["organization_id"], json!("org-1"));
        assert_eq!(payload["lease_id"], json!("lease-1"));
        assert_eq!(payload["kind"], json!("rent"));
        assert_eq!(payload["status"], json!("pending"));
        assert_eq!(payload["due_date"], json!("2024-03-05"));
        assert_eq!(payload["amount"], json!(1450.0));
        assert_eq!(payload["currency"], json!("USD"));
        assert_eq!(payload["unit_id"], json!("unit-1"));
        assert_eq!(payload["property_id"], json!("prop-1"));
    }

    #[test]
    fn charge_payload_omits_absent_linkage() {
        let bare = json!({
            "id": "lease-2",
            "organization_id": "org-1",
            "monthly_rent": 900,
        });
        let payload = build_charge_payload(&bare, ChargeKind::Fee, "2024-03-01", None);

        assert!(!payload.contains_key("unit_id"));
        assert!(!payload.contains_key("property_id"));
        assert_eq!(payload["kind"], json!("fee"));
        assert_eq!(payload["currency"], json!("USD"));
    }

    #[test]
    fn billing_day_defaults_and_clamps() {
        assert_eq!(billing_day(&lease()), 5);
        assert_eq!(billing_day(&json!({"billing_day_of_month": 0})), 1);
        assert_eq!(billing_day(&json!({"billing_day_of_month": 45})), 31);
        assert_eq!(billing_day(&json!({})), 1);
    }
}
