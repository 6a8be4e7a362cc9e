use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

/// Body for `POST /billing/run`.
///
/// `organization_id` is only meaningful for interactive callers; scheduler
/// runs (shared secret) always cover every active organization.
#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct RunBillingInput {
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000))]
    pub year: i32,
    pub organization_id: Option<String>,
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{remove_nulls, serialize_to_map, validate_input, RunBillingInput};

    #[test]
    fn accepts_a_valid_billing_period() {
        let input = RunBillingInput {
            month: 9,
            year: 2025,
            organization_id: None,
        };
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn rejects_out_of_range_month_and_year() {
        let bad_month = RunBillingInput {
            month: 13,
            year: 2025,
            organization_id: None,
        };
        assert!(validate_input(&bad_month).is_err());

        let bad_year = RunBillingInput {
            month: 1,
            year: 1999,
            organization_id: None,
        };
        assert!(validate_input(&bad_year).is_err());
    }

    #[test]
    fn strips_nulls_from_serialized_maps() {
        let map = serialize_to_map(&json!({"a": 1, "b": null}));
        let cleaned = remove_nulls(map);
        assert!(cleaned.contains_key("a"));
        assert!(!cleaned.contains_key("b"));
    }
}
