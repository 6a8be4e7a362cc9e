use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::AppResult;
use crate::repository::table_service::list_rows;
use crate::services::autopay::{attempt_autopay, AutopayOutcome, PaymentGateway};
use crate::services::batch::map_in_batches;
use crate::services::billing_period::BillingPeriod;
use crate::services::lease_charges::{create_charge_for_period, value_str, ChargeKind};

/// Peak in-flight leases per organization; batches beyond it run in strict
/// sequence, so this is also the global ceiling on concurrent payment
/// attempts.
pub const LEASE_BATCH_SIZE: usize = 10;

/// Who a billing run covers, decided once at the entry point and threaded
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingScope {
    /// Scheduler-credentialed run over every active organization.
    System,
    /// Interactive run restricted to one organization.
    Organization(String),
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentErrorEntry {
    pub charge_id: String,
    pub error: String,
}

/// Aggregated result of one billing run. Ephemeral — returned to the
/// caller, never persisted.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub created: u32,
    pub skipped: u32,
    pub payments_processed: u32,
    pub payments_failed: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payment_errors: Vec<PaymentErrorEntry>,
    pub organizations: u32,
}

impl RunSummary {
    fn absorb(&mut self, outcome: LeaseOutcome) {
        match outcome {
            LeaseOutcome::Skipped => self.skipped += 1,
            LeaseOutcome::CreatedOnly => self.created += 1,
            LeaseOutcome::CreatedAndProcessed => {
                self.created += 1;
                self.payments_processed += 1;
            }
            LeaseOutcome::CreatedAndFailed { charge_id, error } => {
                self.created += 1;
                self.payments_failed += 1;
                self.payment_errors.push(PaymentErrorEntry { charge_id, error });
            }
        }
    }
}

/// What happened to one lease within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseOutcome {
    Skipped,
    CreatedOnly,
    CreatedAndProcessed,
    CreatedAndFailed { charge_id: String, error: String },
}

/// Generate this period's rent charges and best-effort collect them.
///
/// Organizations are processed one at a time; inside an organization,
/// leases run in parallel batches of [`LEASE_BATCH_SIZE`]. Charge-creation
/// errors abort the whole run with `?` (record-of-truth operation); payment
/// failures only land in the summary's error list.
pub async fn run_monthly_billing<G: PaymentGateway>(
    pool: &PgPool,
    gateway: &G,
    scope: &BillingScope,
    period: BillingPeriod,
) -> AppResult<RunSummary> {
    let org_ids = match scope {
        BillingScope::System => list_active_org_ids(pool).await?,
        BillingScope::Organization(org_id) => vec![org_id.clone()],
    };

    let mut summary = RunSummary {
        organizations: org_ids.len() as u32,
        ..RunSummary::default()
    };

    for org_id in &org_ids {
        let leases = find_active_leases(pool, org_id).await?;
        tracing::info!(
            org_id,
            leases = leases.len(),
            month = period.month(),
            year = period.year(),
            "Generating charges for organization"
        );

        let outcomes = map_in_batches(leases, LEASE_BATCH_SIZE, |lease| async move {
            process_lease(pool, gateway, lease, period).await
        })
        .await;

        for outcome in outcomes {
            summary.absorb(outcome?);
        }
    }

    tracing::info!(
        organizations = summary.organizations,
        created = summary.created,
        skipped = summary.skipped,
        payments_processed = summary.payments_processed,
        payments_failed = summary.payments_failed,
        "Billing run completed"
    );

    Ok(summary)
}

async fn process_lease<G: PaymentGateway>(
    pool: &PgPool,
    gateway: &G,
    lease: Value,
    period: BillingPeriod,
) -> AppResult<LeaseOutcome> {
    let Some(charge) = create_charge_for_period(pool, &lease, ChargeKind::Rent, period).await?
    else {
        return Ok(LeaseOutcome::Skipped);
    };

    Ok(match attempt_autopay(gateway, &charge).await {
        AutopayOutcome::NoMethod => LeaseOutcome::CreatedOnly,
        AutopayOutcome::Processed => LeaseOutcome::CreatedAndProcessed,
        AutopayOutcome::Failed(error) => {
            let charge_id = value_str(&charge, "id");
            tracing::warn!(charge_id, error, "Payment attempt failed");
            LeaseOutcome::CreatedAndFailed { charge_id, error }
        }
    })
}

async fn list_active_org_ids(pool: &PgPool) -> AppResult<Vec<String>> {
    let mut filters = Map::new();
    filters.insert("is_active".to_string(), Value::Bool(true));

    let organizations = list_rows(pool, "organizations", Some(&filters), 1000, "created_at", true).await?;
    Ok(organizations
        .iter()
        .map(|row| value_str(row, "id"))
        .filter(|id| !id.is_empty())
        .collect())
}

async fn find_active_leases(pool: &PgPool, org_id: &str) -> AppResult<Vec<Value>> {
    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(org_id.to_string()),
    );
    filters.insert(
        "lease_status".to_string(),
        Value::String("active".to_string()),
    );

    list_rows(pool, "leases", Some(&filters), 1000, "created_at", true).await
}

/// Constant-shape comparison of the shared scheduler credential. An unset
/// or empty configured secret never matches anything.
pub fn scheduler_secret_matches(provided: Option<&str>, configured: Option<&str>) -> bool {
    let Some(configured) = configured.map(str::trim).filter(|value| !value.is_empty()) else {
        return false;
    };
    let Some(provided) = provided.map(str::trim).filter(|value| !value.is_empty()) else {
        return false;
    };
    provided == configured
}
