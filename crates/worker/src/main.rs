// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Teranga Background Worker
//!
//! Handles scheduled jobs:
//! - Expiry sweep: overdue listings, timed-out payments, old quota periods
//!   (`SWEEP_CRON`, every 5 minutes by default)
//! - Monetization invariant checks (hourly)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use teranga_monetization::{
    CacheInvalidator, Clock, DisabledGateway, HmacSignatureVerifier, InvariantChecker,
    MonetizationService, NoopCacheInvalidator, PgStore, RedisCacheInvalidator, SystemClock,
};
use teranga_shared::{create_pool, init_tracing};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::jobs::{run_invariant_checks, SweepJob};

const DEFAULT_SWEEP_CRON: &str = "0 */5 * * * *";
const INVARIANT_CRON: &str = "0 0 * * * *";
const DEFAULT_QUOTA_RETENTION_MONTHS: u32 = 12;

#[derive(Debug, thiserror::Error)]
enum WorkerConfigError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
    #[error("QUOTA_RETENTION_MONTHS must be a positive integer, got '{0}'")]
    InvalidRetention(String),
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    redis_url: Option<String>,
    sweep_cron: String,
    quota_retention_months: u32,
}

impl WorkerConfig {
    fn from_env() -> Result<Self, WorkerConfigError> {
        let database_url =
            env_non_empty("DATABASE_URL").ok_or(WorkerConfigError::MissingDatabaseUrl)?;

        let quota_retention_months = match env_non_empty("QUOTA_RETENTION_MONTHS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or(WorkerConfigError::InvalidRetention(raw))?,
            None => DEFAULT_QUOTA_RETENTION_MONTHS,
        };

        Ok(Self {
            database_url,
            redis_url: env_non_empty("REDIS_URL"),
            sweep_cron: env_non_empty("SWEEP_CRON")
                .unwrap_or_else(|| DEFAULT_SWEEP_CRON.to_string()),
            quota_retention_months,
        })
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing("info,teranga_worker=debug");

    info!("Starting Teranga Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;
    info!(
        sweep_cron = %config.sweep_cron,
        quota_retention_months = config.quota_retention_months,
        "Worker configuration loaded"
    );

    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    let cache: Arc<dyn CacheInvalidator> = match &config.redis_url {
        Some(redis_url) => match RedisCacheInvalidator::connect(redis_url).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(error = %e, "Redis unavailable - cache invalidation disabled");
                Arc::new(NoopCacheInvalidator)
            }
        },
        None => Arc::new(NoopCacheInvalidator),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // The worker never opens checkouts or receives webhooks.
    let monetization = MonetizationService::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(DisabledGateway),
        Arc::new(HmacSignatureVerifier::new()),
        cache,
        clock.clone(),
    );

    let sweep_job = SweepJob::new(
        monetization
            .sweeper
            .with_retention_months(config.quota_retention_months),
    );
    let checker = Arc::new(InvariantChecker::new(pool, clock));

    // Catch up on anything that expired while the worker was down
    sweep_job.run().await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep
    let job = sweep_job.clone();
    scheduler
        .add(Job::new_async(config.sweep_cron.as_str(), move |_uuid, _l| {
            let job = job.clone();
            Box::pin(async move {
                job.run().await;
            })
        })?)
        .await?;
    info!(cron = %config.sweep_cron, "Scheduled: Expiry sweep");

    // Job 2: Invariant checks (hourly)
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(INVARIANT_CRON, move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                run_invariant_checks(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Teranga Worker started with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
