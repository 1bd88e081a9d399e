//! BountyView Worker
//!
//! Consumes jobs from the durable queue and fires the recurring
//! reconciliation triggers. Any number of worker processes may run against
//! the same database; job claims use SKIP LOCKED and every handler is
//! idempotent under redelivery.

use std::sync::Arc;
use std::time::Duration;

use bountyview::jobs::{self, JobError, WorkerContext};
use bountyview::{CircleClient, Config, EscrowChainClient, JobQueue, PgStore, QueueName, RetryPolicy};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Recurring trigger cadences.
const SYNC_ESCROW_EVERY_SECS: u64 = 2 * 60;
const RECOVER_ORPHANS_EVERY_SECS: u64 = 5 * 60;
const RECONCILE_BOUNTIES_EVERY_SECS: u64 = 15 * 60;

/// How often the scheduler checks for due triggers.
const SCHEDULER_TICK_SECS: u64 = 15;

#[derive(Debug, Parser)]
#[command(name = "bounty-worker", about = "BountyView reconciliation worker")]
struct Args {
    /// Concurrent job consumers in this process
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Idle poll interval in milliseconds
    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(
        "Starting BountyView worker (concurrency: {})",
        args.concurrency
    );

    let config = Config::load()?;
    let store = PgStore::from_env().await?;
    info!("PostgreSQL storage initialized");

    let queue = JobQueue::new(store.pool(), RetryPolicy::default());

    queue
        .ensure_schedule(
            QueueName::SyncEscrowEvents,
            Duration::from_secs(SYNC_ESCROW_EVERY_SECS),
        )
        .await?;
    queue
        .ensure_schedule(
            QueueName::RecoverOrphanedPayouts,
            Duration::from_secs(RECOVER_ORPHANS_EVERY_SECS),
        )
        .await?;
    queue
        .ensure_schedule(
            QueueName::ReconcileBountyState,
            Duration::from_secs(RECONCILE_BOUNTIES_EVERY_SECS),
        )
        .await?;

    let context = Arc::new(WorkerContext {
        chain: EscrowChainClient::new(&config.chain),
        circle: CircleClient::new(&config.circle, config.circle_api_key()),
        queue: queue.clone(),
        store,
        config,
    });

    // Scheduler: promote due recurring triggers into queue jobs.
    let scheduler_queue = queue.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = scheduler_queue.enqueue_due_schedules().await {
                error!("Scheduler tick failed: {}", e);
            }
        }
    });
    info!("Recurring schedules registered (2m/5m/15m)");

    let mut handles = Vec::new();
    for worker_id in 0..args.concurrency {
        let context = context.clone();
        let poll_interval = Duration::from_millis(args.poll_interval_ms);
        handles.push(tokio::spawn(async move {
            consume_jobs(worker_id, context, poll_interval).await;
        }));
    }

    futures::future::join_all(handles).await;
    Ok(())
}

async fn consume_jobs(worker_id: usize, ctx: Arc<WorkerContext>, poll_interval: Duration) {
    loop {
        let job = match ctx.queue.fetch_next(&QueueName::ALL).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                error!("[worker {}] Failed to fetch job: {}", worker_id, e);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let job_id = job.id;
        let queue_name = job.queue.as_str();

        match jobs::run(&job, &ctx).await {
            Ok(()) => {
                if let Err(e) = ctx.queue.complete(job_id).await {
                    error!(
                        "[worker {}] Failed to complete job {}: {}",
                        worker_id, job_id, e
                    );
                }
            }
            Err(JobError::Retry(source)) => {
                if let Err(e) = ctx.queue.retry_or_bury(&job, &format!("{source:#}")).await {
                    error!(
                        "[worker {}] Failed to reschedule job {}: {}",
                        worker_id, job_id, e
                    );
                }
            }
            Err(JobError::Terminal(source)) => {
                error!(
                    "[worker {}] Job {} ({}) failed terminally: {:#}",
                    worker_id, job_id, queue_name, source
                );
                if let Err(e) = ctx.queue.bury(job_id, &format!("{source:#}")).await {
                    error!(
                        "[worker {}] Failed to bury job {}: {}",
                        worker_id, job_id, e
                    );
                }
            }
        }
    }
}
