use axum::{extract::State, http::HeaderMap, Json};
use serde_json::Value;

use crate::{
    auth::{header_value, require_user_id},
    error::{AppError, AppResult},
    schemas::{serialize_to_map, validate_input, RunBillingInput},
    services::{
        audit::write_audit_log,
        autopay::StripeAutopayGateway,
        billing_period::BillingPeriod,
        billing_run::{run_monthly_billing, scheduler_secret_matches, BillingScope},
    },
    state::AppState,
    tenancy::{assert_org_role, db_pool, list_user_org_ids},
};

const BILLING_RUN_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];
const SCHEDULER_SECRET_HEADER: &str = "x-scheduler-secret";

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/billing/run", axum::routing::post(run_billing))
}

/// Trigger the recurring charge generation + auto-payment dispatch run for
/// one billing period. Reachable by the scheduler (shared secret header →
/// every active organization) or by an authenticated member of a single
/// organization.
async fn run_billing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RunBillingInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let period = BillingPeriod::new(payload.month, payload.year)?;

    let (scope, actor_user_id) =
        resolve_billing_scope(&state, &headers, payload.organization_id.as_deref()).await?;

    let pool = db_pool(&state)?;
    let gateway = StripeAutopayGateway::new(
        pool.clone(),
        state.http_client.clone(),
        state.config.stripe_secret_key.clone(),
        state.config.autopay_enabled,
    );

    let summary = run_monthly_billing(pool, &gateway, &scope, period).await?;

    let audit_org = match &scope {
        BillingScope::System => None,
        BillingScope::Organization(org_id) => Some(org_id.as_str()),
    };
    write_audit_log(
        state.db_pool.as_ref(),
        audit_org,
        actor_user_id.as_deref(),
        "billing_run",
        "lease_charges",
        None,
        serde_json::to_value(&summary).ok(),
    )
    .await;

    let mut body = serialize_to_map(&summary);
    body.insert("month".to_string(), Value::from(payload.month));
    body.insert("year".to_string(), Value::from(payload.year));
    Ok(Json(Value::Object(body)))
}

/// Decide the run's scope exactly once. A matching scheduler secret wins;
/// otherwise the caller must authenticate and prove membership in the one
/// organization the run will cover.
async fn resolve_billing_scope(
    state: &AppState,
    headers: &HeaderMap,
    requested_org: Option<&str>,
) -> AppResult<(BillingScope, Option<String>)> {
    if let Some(provided) = header_value(headers, SCHEDULER_SECRET_HEADER) {
        if scheduler_secret_matches(
            Some(&provided),
            state.config.billing_scheduler_secret.as_deref(),
        ) {
            return Ok((BillingScope::System, None));
        }
        tracing::warn!("Billing run attempted with an invalid scheduler secret");
    }

    let user_id = require_user_id(state, headers).await?;
    let org_id = match requested_org.map(str::trim).filter(|value| !value.is_empty()) {
        Some(org_id) => org_id.to_string(),
        None => sole_org_for_user(state, &user_id).await?,
    };
    assert_org_role(state, &user_id, &org_id, BILLING_RUN_ROLES).await?;

    Ok((BillingScope::Organization(org_id), Some(user_id)))
}

async fn sole_org_for_user(state: &AppState, user_id: &str) -> AppResult<String> {
    let org_ids = list_user_org_ids(state, user_id).await?;
    match org_ids.as_slice() {
        [] => Err(AppError::Forbidden(
            "Forbidden: no organization membership.".to_string(),
        )),
        [only] => Ok(only.clone()),
        _ => Err(AppError::BadRequest(
            "organization_id is required when you belong to multiple organizations.".to_string(),
        )),
    }
}
