//! Durable job queue on PostgreSQL
//!
//! Named queues with JSON payloads and at-least-once delivery. Workers claim
//! jobs with FOR UPDATE SKIP LOCKED, so any number of worker processes can
//! share one queue. Failed jobs are retried on an exponential backoff curve
//! until the retry policy is exhausted, then dead-lettered. Recurring
//! triggers live in a schedules table so they survive process restarts.

use std::time::Duration;

use anyhow::{anyhow, Result};
use deadpool_postgres::Pool;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    SyncEscrowEvents,
    ReconcileBountyState,
    RecoverOrphanedPayouts,
    CircleWithdrawStatusPoll,
    SendNotification,
    IntegrationEvents,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::SyncEscrowEvents,
        QueueName::ReconcileBountyState,
        QueueName::RecoverOrphanedPayouts,
        QueueName::CircleWithdrawStatusPoll,
        QueueName::SendNotification,
        QueueName::IntegrationEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::SyncEscrowEvents => "sync_escrow_events",
            QueueName::ReconcileBountyState => "reconcile_bounty_state",
            QueueName::RecoverOrphanedPayouts => "recover_orphaned_payouts",
            QueueName::CircleWithdrawStatusPoll => "circle_withdraw_status_poll",
            QueueName::SendNotification => "send_notification",
            QueueName::IntegrationEvents => "integration_events",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| anyhow!("unknown queue: {s}"))
    }
}

/// Bounded retry with an exponential backoff curve. Passed explicitly to the
/// queue; there is no hidden global retry configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering after the given (1-based) failed attempt:
    /// base * 2^(attempt-1), capped at max_delay.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let delay = self
            .base_delay
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// One claimed unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: Value,
    /// Delivery count including this one.
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: Pool,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Enqueue a job for immediate delivery.
    pub async fn enqueue(&self, queue: QueueName, payload: Value) -> Result<Uuid> {
        self.enqueue_in(queue, payload, Duration::ZERO).await
    }

    /// Enqueue a job delayed by `delay`.
    pub async fn enqueue_in(
        &self,
        queue: QueueName,
        payload: Value,
        delay: Duration,
    ) -> Result<Uuid> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                "INSERT INTO jobs (queue, payload, max_attempts, scheduled_at)
                 VALUES ($1, $2, $3, now() + ($4::float8 * interval '1 second'))
                 RETURNING id",
                &[
                    &queue.as_str(),
                    &payload,
                    &self.policy.max_attempts,
                    &delay.as_secs_f64(),
                ],
            )
            .await?;

        let id: Uuid = row.get(0);
        debug!("Enqueued {} job {}", queue.as_str(), id);
        Ok(id)
    }

    /// Claim the next available job from any of the given queues. Increments
    /// the delivery count as part of the claim, so a worker crash still
    /// counts the delivery once the job is recovered.
    pub async fn fetch_next(&self, queues: &[QueueName]) -> Result<Option<Job>> {
        let client = self.pool.get().await?;
        let names: Vec<&str> = queues.iter().map(|q| q.as_str()).collect();

        let row = client
            .query_opt(
                "UPDATE jobs
                 SET state = 'active', started_at = now(), attempts = attempts + 1
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE state = 'available' AND queue = ANY($1) AND scheduled_at <= now()
                     ORDER BY scheduled_at
                     FOR UPDATE SKIP LOCKED
                     LIMIT 1
                 )
                 RETURNING id, queue, payload, attempts, max_attempts",
                &[&names],
            )
            .await?;

        row.map(|r| {
            Ok(Job {
                id: r.get(0),
                queue: QueueName::parse(r.get(1))?,
                payload: r.get(2),
                attempts: r.get(3),
                max_attempts: r.get(4),
            })
        })
        .transpose()
    }

    pub async fn complete(&self, job_id: Uuid) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE jobs SET state = 'completed', finished_at = now() WHERE id = $1",
                &[&job_id],
            )
            .await?;
        Ok(())
    }

    /// Reschedule a failed job on the backoff curve, or dead-letter it once
    /// the retry budget is spent. A little jitter keeps a burst of failures
    /// from thundering back in lockstep.
    pub async fn retry_or_bury(&self, job: &Job, error: &str) -> Result<()> {
        let client = self.pool.get().await?;

        if job.attempts >= job.max_attempts {
            client
                .execute(
                    "UPDATE jobs SET state = 'dead', finished_at = now(), last_error = $2 WHERE id = $1",
                    &[&job.id, &error],
                )
                .await?;
            warn!(
                "Job {} ({}) dead-lettered after {} attempts: {}",
                job.id,
                job.queue.as_str(),
                job.attempts,
                error
            );
            return Ok(());
        }

        let delay = self.policy.delay_for(job.attempts);
        let jitter = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64() * 0.1);

        client
            .execute(
                "UPDATE jobs
                 SET state = 'available', last_error = $2,
                     scheduled_at = now() + ($3::float8 * interval '1 second')
                 WHERE id = $1",
                &[&job.id, &error, &(delay.as_secs_f64() + jitter)],
            )
            .await?;

        debug!(
            "Job {} ({}) retry {}/{} in ~{}s: {}",
            job.id,
            job.queue.as_str(),
            job.attempts,
            job.max_attempts,
            delay.as_secs(),
            error
        );
        Ok(())
    }

    /// Dead-letter a job immediately. Used for errors classified terminal,
    /// which redelivery can never fix.
    pub async fn bury(&self, job_id: Uuid, error: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE jobs SET state = 'dead', finished_at = now(), last_error = $2 WHERE id = $1",
                &[&job_id, &error],
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // RECURRING SCHEDULES
    // ========================================================================

    /// Register (or retune) a recurring trigger for a queue.
    pub async fn ensure_schedule(&self, queue: QueueName, every: Duration) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .execute(
                "INSERT INTO job_schedules (queue, every_seconds)
                 VALUES ($1, $2)
                 ON CONFLICT (queue) DO UPDATE SET every_seconds = EXCLUDED.every_seconds",
                &[&queue.as_str(), &(every.as_secs() as i64)],
            )
            .await?;

        info!(
            "Schedule registered: {} every {}s",
            queue.as_str(),
            every.as_secs()
        );
        Ok(())
    }

    /// Enqueue one job for every schedule whose trigger time has arrived.
    /// The conditional update makes this safe to run from many workers.
    pub async fn enqueue_due_schedules(&self) -> Result<u32> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "UPDATE job_schedules
                 SET next_run_at = now() + make_interval(secs => every_seconds)
                 WHERE next_run_at <= now()
                 RETURNING queue",
                &[],
            )
            .await?;

        let mut fired = 0;
        for row in &rows {
            let queue = QueueName::parse(row.get(0))?;
            self.enqueue(queue, serde_json::json!({ "trigger": "schedule" }))
                .await?;
            fired += 1;
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_roundtrip() {
        for queue in QueueName::ALL {
            assert_eq!(QueueName::parse(queue.as_str()).unwrap(), queue);
        }
        assert!(QueueName::parse("no_such_queue").is_err());
    }

    #[test]
    fn test_backoff_curve_monotonic_and_bounded() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));

        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last);
            assert!(delay <= policy.max_delay);
            last = delay;
        }

        // deep into the curve the cap holds
        assert_eq!(policy.delay_for(1000), policy.max_delay);
        // attempt 0 and 1 both map to the base delay
        assert_eq!(policy.delay_for(0), policy.base_delay);
    }

    #[test]
    fn test_custom_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
    }
}
