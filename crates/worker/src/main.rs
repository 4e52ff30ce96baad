// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! BoxBilling background worker.
//!
//! Runs the four scheduled jobs over every organization, each behind a
//! `task_leases` row so an overlapping fire or a worker restart mid-tick
//! cannot duplicate the work:
//!
//! - `periodic_invoicing` — daily at 00:10 UTC, subscriptions whose period
//!   just elapsed
//! - `trial_expiry` — hourly, subscriptions leaving trial
//! - `dunning_tick` — daily at 06:00 UTC, the payment-request retry loop
//! - `webhook_retry` — every minute, the outbox's due-for-retry scan

use bxb_core::{tasks, CoreService};
use bxb_shared::Config;
use sqlx::PgPool;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

async fn active_organization_ids(pool: &PgPool) -> anyhow::Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM organizations")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Daily period key, UTC calendar date — the lease granularity for
/// once-a-day jobs.
fn daily_period(now: OffsetDateTime) -> String {
    now.date().to_string()
}

/// Hourly period key for jobs that tick more than once a day.
fn hourly_period(now: OffsetDateTime) -> String {
    format!("{}T{:02}", now.date(), now.hour())
}

/// Minute period key for the webhook retry sweep.
fn minute_period(now: OffsetDateTime) -> String {
    format!("{}T{:02}:{:02}", now.date(), now.hour(), now.minute())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    info!("starting bxb-worker");

    let pool = bxb_shared::create_pool(&config.database_url).await?;
    let services = Arc::new(CoreService::with_null_provider(pool.clone(), config));

    let scheduler = JobScheduler::new().await?;

    let invoicing_pool = pool.clone();
    let invoicing_services = services.clone();
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let pool = invoicing_pool.clone();
            let services = invoicing_services.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                let period = daily_period(now);
                let orgs = match active_organization_ids(&pool).await {
                    Ok(orgs) => orgs,
                    Err(e) => {
                        error!(error = %e, "periodic_invoicing: failed to list organizations");
                        return;
                    }
                };
                for org_id in orgs {
                    match tasks::periodic_invoicing(&services, org_id, &period).await {
                        Ok(true) => info!(organization_id = %org_id, period = %period, "periodic_invoicing ran"),
                        Ok(false) => {}
                        Err(e) => error!(organization_id = %org_id, error = %e, "periodic_invoicing failed"),
                    }
                }
            })
        })?)
        .await?;
    info!("scheduled: periodic_invoicing (daily at 00:10 UTC)");

    let trial_pool = pool.clone();
    let trial_services = services.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = trial_pool.clone();
            let services = trial_services.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                let period = hourly_period(now);
                let orgs = match active_organization_ids(&pool).await {
                    Ok(orgs) => orgs,
                    Err(e) => {
                        error!(error = %e, "trial_expiry: failed to list organizations");
                        return;
                    }
                };
                for org_id in orgs {
                    if let Err(e) = tasks::trial_expiry(&services, org_id, &period).await {
                        error!(organization_id = %org_id, error = %e, "trial_expiry failed");
                    }
                }
            })
        })?)
        .await?;
    info!("scheduled: trial_expiry (hourly)");

    let dunning_pool = pool.clone();
    let dunning_services = services.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let pool = dunning_pool.clone();
            let services = dunning_services.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                let period = daily_period(now);
                let orgs = match active_organization_ids(&pool).await {
                    Ok(orgs) => orgs,
                    Err(e) => {
                        error!(error = %e, "dunning_tick: failed to list organizations");
                        return;
                    }
                };
                for org_id in orgs {
                    if let Err(e) = tasks::dunning_tick(&services, org_id, &period).await {
                        error!(organization_id = %org_id, error = %e, "dunning_tick failed");
                    }
                }
            })
        })?)
        .await?;
    info!("scheduled: dunning_tick (daily at 06:00 UTC)");

    let webhook_pool = pool.clone();
    let webhook_services = services.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let pool = webhook_pool.clone();
            let services = webhook_services.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                let period = minute_period(now);
                let orgs = match active_organization_ids(&pool).await {
                    Ok(orgs) => orgs,
                    Err(e) => {
                        error!(error = %e, "webhook_retry: failed to list organizations");
                        return;
                    }
                };
                for org_id in orgs {
                    if let Err(e) = tasks::webhook_retry(&services, org_id, &period).await {
                        error!(organization_id = %org_id, error = %e, "webhook_retry failed");
                    }
                }
            })
        })?)
        .await?;
    info!("scheduled: webhook_retry (every minute)");

    scheduler.start().await?;
    info!("bxb-worker started with 4 scheduled jobs");

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
