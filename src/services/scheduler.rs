use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::time::sleep;

use crate::services::autopay::StripeAutopayGateway;
use crate::services::billing_period::BillingPeriod;
use crate::services::billing_run::{run_monthly_billing, BillingScope};
use crate::state::AppState;

/// Spawn the background scheduler that runs periodic jobs.
///
/// Each job runs in its own `tokio::spawn` so a failure in one job never
/// crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    if state.db_pool.is_none() {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    }

    let mut last_daily_run: Option<u32> = None;

    loop {
        sleep(Duration::from_secs(60)).await;

        let now_utc = Utc::now();
        let today = now_utc.date_naive();

        // Daily jobs run once per calendar day, at or after 05:00 UTC.
        if last_daily_run == Some(today.ordinal()) {
            continue;
        }
        if now_utc.hour() < 5 {
            continue;
        }
        last_daily_run = Some(today.ordinal());

        // 1st of the month — system-wide recurring charge generation.
        if today.day() == 1 {
            let st = state.clone();
            tokio::spawn(async move {
                run_scheduled_monthly_billing(&st, today.month(), today.year()).await;
            });
        }
    }
}

async fn run_scheduled_monthly_billing(state: &AppState, month: u32, year: i32) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };

    let period = match BillingPeriod::new(month, year) {
        Ok(period) => period,
        Err(error) => {
            tracing::warn!(%error, month, year, "Scheduler: invalid billing period");
            return;
        }
    };

    let gateway = StripeAutopayGateway::new(
        pool.clone(),
        state.http_client.clone(),
        state.config.stripe_secret_key.clone(),
        state.config.autopay_enabled,
    );

    match run_monthly_billing(pool, &gateway, &BillingScope::System, period).await {
        Ok(summary) => {
            tracing::info!(
                created = summary.created,
                skipped = summary.skipped,
                payments_processed = summary.payments_processed,
                payments_failed = summary.payments_failed,
                organizations = summary.organizations,
                "Scheduler: monthly billing run completed"
            );
            crate::services::audit::write_audit_log(
                state.db_pool.as_ref(),
                None,
                None,
                "billing_run",
                "lease_charges",
                None,
                serde_json::to_value(&summary).ok(),
            )
            .await;
        }
        Err(error) => {
            tracing::warn!(%error, month, year, "Scheduler: monthly billing run failed");
        }
    }
}
