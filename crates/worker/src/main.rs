#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Ledgerly Background Worker
//!
//! Handles scheduled billing jobs:
//! - Plan catalog reconcile against Stripe (daily at 3:00 AM UTC)
//! - Trial expiry sweep (hourly)
//!
//! One-shot commands:
//! - `ledgerly-worker sync-plans` seeds the catalog and syncs every plan, then exits
//! - `ledgerly-worker replay-event <evt_id>` re-runs the handler for a Stripe event
//! - `ledgerly-worker list-events [limit]` prints the most recently processed events

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ledgerly_billing::{BillingService, SyncSummary};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_EVENT_LIMIT: i64 = 20;

/// Trials ending within this many days are reported by the sweep
const TRIAL_WARNING_DAYS: i64 = 3;

enum Command {
    Run,
    SyncPlans,
    ReplayEvent(String),
    ListEvents(i64),
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [] => Ok(Command::Run),
        [cmd] if cmd == "sync-plans" => Ok(Command::SyncPlans),
        [cmd, event_id] if cmd == "replay-event" => Ok(Command::ReplayEvent(event_id.clone())),
        [cmd] if cmd == "list-events" => Ok(Command::ListEvents(DEFAULT_EVENT_LIMIT)),
        [cmd, limit] if cmd == "list-events" => limit
            .parse()
            .map(Command::ListEvents)
            .with_context(|| format!("Invalid event limit: {}", limit)),
        other => anyhow::bail!(
            "Unknown arguments {:?}; expected `sync-plans`, `replay-event <evt_id>` or `list-events [limit]`",
            other
        ),
    }
}

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Seed the compiled-in catalog, then create missing Stripe products and prices
async fn reconcile_catalog(billing: &BillingService) -> anyhow::Result<SyncSummary> {
    let seeded = billing.plans.seed_catalog().await?;
    let summary = billing.plans.sync_all().await?;
    info!(
        seeded = seeded,
        synced = summary.synced,
        already_synced = summary.already_synced,
        failed = summary.failed,
        "Plan catalog reconcile complete"
    );
    Ok(summary)
}

async fn sweep_trials(billing: &BillingService) {
    match billing
        .subscriptions
        .trials_ending_within(TRIAL_WARNING_DAYS)
        .await
    {
        Ok(ending) => {
            for (record, trial) in &ending {
                info!(
                    workspace_id = %record.workspace_id,
                    subscription_id = %record.provider_subscription_id,
                    trial_end = ?trial.trial_end,
                    days_remaining = trial.days_remaining,
                    "Trial ending soon"
                );
            }
            info!(count = ending.len(), "Trial sweep complete");
        }
        Err(e) => error!(error = %e, "Trial sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    info!("Starting Ledgerly Worker");

    // Create database pool
    let pool = create_db_pool().await?;
    ledgerly_billing::run_migrations(&pool).await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            if !matches!(command, Command::Run) {
                return Err(e).context("Billing is not configured");
            }
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        info!("Worker heartbeat (minimal mode)");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        return Ok(());
                    }
                }
            }
        }
    };

    match command {
        Command::SyncPlans => {
            let summary = reconcile_catalog(&billing).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} plan(s) failed to sync", summary.failed);
            }
            return Ok(());
        }
        Command::ReplayEvent(event_id) => {
            let outcome = billing.webhooks.replay_event(&event_id).await?;
            info!(event_id = %event_id, outcome = ?outcome, "Event replayed");
            return Ok(());
        }
        Command::ListEvents(limit) => {
            for event in billing.webhooks.list_events(limit, 0).await? {
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    processed_at = %event.processed_at,
                    "Processed event"
                );
            }
            return Ok(());
        }
        Command::Run => {}
    }

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Plan catalog reconcile (daily at 3:00 AM UTC)
    let catalog_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = catalog_billing.clone();
            Box::pin(async move {
                info!("Running plan catalog reconcile");
                if let Err(e) = reconcile_catalog(&billing).await {
                    error!(error = %e, "Plan catalog reconcile failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Plan catalog reconcile (daily at 3:00 AM UTC)");

    // Job 2: Trial expiry sweep (hourly)
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                sweep_trials(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Ledgerly Worker started successfully with {} scheduled jobs", 2);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    Ok(())
}
