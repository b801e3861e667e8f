#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Condominium Licensing Worker
//!
//! Handles scheduled jobs:
//! - License reconciliation: recalculates `used_licenses` for every
//!   subscription (cron from `LICENSE_RECONCILE_CRON`, every 30 minutes by default)
//! - Invariant checks after each reconciliation sweep
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use condo_billing::{
    BillingResult, LicensingConfig, LicensingService, PgLicenseStore,
    ReconcileResult, ReconcileSummary,
};
use condo_shared::types::SubscriptionId;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

type Service = LicensingService<PgLicenseStore>;

/// Run `op`, retrying only transient store failures
async fn with_retry<T, F, Fut>(max_retries: usize, what: &str, op: F) -> BillingResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = BillingResult<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .max_delay(RETRY_MAX_DELAY)
        .take(max_retries)
        .map(jitter);

    Retry::spawn(retry_strategy, || async {
        let result = op().await;
        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_transient() => {
                warn!(operation = what, error = %e, "Transient error - will retry");
                Err(result) // Return error to trigger retry
            }
            Err(_) => Ok(result), // Permanent error, stop retrying
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

async fn reconcile_one(
    service: &Service,
    subscription_id: SubscriptionId,
    max_retries: usize,
) -> ReconcileResult {
    let result = with_retry(max_retries, "reconcile_subscription", || {
        service.reconciler.reconcile_subscription(subscription_id)
    })
    .await;

    result.unwrap_or_else(|e| {
        error!(subscription_id = %subscription_id, error = %e, "Failed to reconcile subscription");
        ReconcileResult::Error {
            subscription_id,
            error: e.to_string(),
        }
    })
}

/// Fail the sweep when any subscription could not be reconciled
fn sweep_outcome(summary: &ReconcileSummary) -> anyhow::Result<()> {
    if summary.errors > 0 {
        bail!(
            "{} of {} subscriptions could not be reconciled",
            summary.errors,
            summary.unchanged + summary.corrected + summary.errors
        );
    }
    Ok(())
}

/// One reconciliation sweep followed by an invariant check
async fn run_reconciliation(service: &Service, max_retries: usize) -> anyhow::Result<()> {
    let ids = with_retry(max_retries, "list_subscriptions", || {
        service.reconciler.subscription_ids()
    })
    .await?;

    let mut results = Vec::with_capacity(ids.len());
    for subscription_id in ids {
        results.push(reconcile_one(service, subscription_id, max_retries).await);
    }

    let summary = ReconcileSummary::from_results(&results);
    info!(
        unchanged = summary.unchanged,
        corrected = summary.corrected,
        errors = summary.errors,
        "License reconciliation cycle complete"
    );

    let checks = service.invariants.run_all_checks().await?;
    for violation in &checks.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            description = %violation.description,
            "License invariant violated"
        );
    }

    sweep_outcome(&summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting condominium licensing worker");

    let config = LicensingConfig::from_env()?;
    let database_url = config.require_database_url()?;

    condo_shared::db::migrate(database_url).await?;
    info!("Database migrations applied");

    let pool =
        condo_shared::db::create_pool(database_url, config.database_max_connections).await?;
    info!(
        max_connections = config.database_max_connections,
        "Database pool created"
    );

    let service = Arc::new(LicensingService::postgres(pool, &config));
    let max_retries = config.reconcile_max_retries;

    let scheduler = JobScheduler::new().await?;

    // Job 1: License reconciliation
    let reconcile_service = service.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let service = reconcile_service.clone();
            Box::pin(async move {
                info!("Running scheduled license reconciliation");
                if let Err(e) = run_reconciliation(&service, max_retries).await {
                    error!(error = %e, "License reconciliation failed");
                }
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: License reconciliation");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Reconcile once at startup so drift is not left for a full interval
    if let Err(e) = run_reconciliation(&service, max_retries).await {
        error!(error = %e, "Startup license reconciliation failed");
    }

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Licensing worker started with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");
    Ok(())
}
