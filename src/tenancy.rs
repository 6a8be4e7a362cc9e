use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::{error::AppError, state::AppState};

pub fn db_pool(state: &AppState) -> Result<&PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency(
            "Database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
        )
    })
}

/// Fetch the caller's membership row for an organization, going through the
/// short-TTL membership cache so repeated checks inside one run stay cheap.
pub async fn get_org_membership(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Option<Value>, AppError> {
    let cache_key = format!("{org_id}:{user_id}");
    let state_for_load = state.clone();
    let org_id_owned = org_id.to_string();
    let user_id_owned = user_id.to_string();

    state
        .membership_cache
        .try_get_with(cache_key, async move {
            fetch_org_membership(&state_for_load, &user_id_owned, &org_id_owned).await
        })
        .await
        .map_err(|error| (*error).clone())
}

async fn fetch_org_membership(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Option<Value>, AppError> {
    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM organization_members t
         WHERE organization_id = $1::uuid AND user_id = $2::uuid
         LIMIT 1",
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Membership lookup failed: {error}")))?;

    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

pub async fn assert_org_member(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Value, AppError> {
    get_org_membership(state, user_id, org_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden("Forbidden: not a member of this organization.".to_string())
        })
}

pub async fn assert_org_role(
    state: &AppState,
    user_id: &str,
    org_id: &str,
    allowed_roles: &[&str],
) -> Result<Value, AppError> {
    let membership = assert_org_member(state, user_id, org_id).await?;
    let role = membership
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if allowed_roles.contains(&role) {
        return Ok(membership);
    }

    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

pub async fn list_user_org_ids(state: &AppState, user_id: &str) -> Result<Vec<String>, AppError> {
    let pool = db_pool(state)?;
    let rows = sqlx::query(
        "SELECT organization_id::text AS organization_id
         FROM organization_members
         WHERE user_id = $1::uuid
         LIMIT 500",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Membership lookup failed: {error}")))?;

    let mut org_ids = Vec::new();
    for row in rows {
        if let Ok(value) = row.try_get::<String, _>("organization_id") {
            if !value.is_empty() {
                org_ids.push(value);
            }
        }
    }
    Ok(org_ids)
}
