use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Best-effort audit trail write. Audit failures are logged and swallowed —
/// they must never fail the operation being audited.
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    org_id: Option<&str>,
    actor_user_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    payload: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    if let Some(org_id) = org_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert(
            "organization_id".to_string(),
            Value::String(org_id.to_string()),
        );
    }
    if let Some(user_id) = actor_user_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert(
            "actor_user_id".to_string(),
            Value::String(user_id.to_string()),
        );
    }
    if let Some(entity_id) = entity_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert(
            "entity_id".to_string(),
            Value::String(entity_id.to_string()),
        );
    }
    if let Some(payload) = payload {
        record.insert("payload".to_string(), payload);
    }

    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(%error, action, entity_type, "Failed to write audit log");
    }
}
