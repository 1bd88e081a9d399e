//! Background job handlers
//!
//! Every handler is idempotent under redelivery: conditional inserts and
//! status-guarded updates only, never blind writes. Errors are classified
//! retryable (the queue redelivers with backoff) or terminal (dead-lettered
//! immediately).

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::EscrowChainClient;
use crate::circle::{normalize_transfer_status, CircleClient, ProviderError};
use crate::config::Config;
use crate::notify;
use crate::queue::{Job, JobQueue, QueueName};
use crate::store::PgStore;

#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the queue redelivers on the backoff curve.
    #[error("retryable: {0}")]
    Retry(#[source] anyhow::Error),
    /// Redelivery can never fix this; the job is dead-lettered.
    #[error("terminal: {0}")]
    Terminal(#[source] anyhow::Error),
}

fn retry(err: impl Into<anyhow::Error>) -> JobError {
    JobError::Retry(err.into())
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncEscrowPayload {
    #[serde(default)]
    pub from_block: Option<u64>,
    #[serde(default)]
    pub to_block: Option<u64>,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub bounty_id: Option<Uuid>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawPollPayload {
    pub payout_id: Uuid,
    pub external_ref: String,
}

// ============================================================================
// WORKER CONTEXT
// ============================================================================

/// Everything a handler needs, constructed once at worker start and passed
/// by reference. No global clients.
pub struct WorkerContext {
    pub store: PgStore,
    pub chain: EscrowChainClient,
    pub circle: CircleClient,
    pub queue: JobQueue,
    pub config: Config,
}

/// Dispatch one claimed job to its handler.
pub async fn run(job: &Job, ctx: &WorkerContext) -> Result<(), JobError> {
    match job.queue {
        QueueName::SyncEscrowEvents => {
            let payload: SyncEscrowPayload =
                serde_json::from_value(job.payload.clone()).unwrap_or_default();
            sync_escrow_events(ctx, payload).await
        }
        QueueName::ReconcileBountyState => reconcile_bounty_state(ctx).await,
        QueueName::RecoverOrphanedPayouts => recover_orphaned_payouts(ctx).await,
        QueueName::CircleWithdrawStatusPoll => {
            let payload: WithdrawPollPayload = serde_json::from_value(job.payload.clone())
                .map_err(|e| JobError::Terminal(anyhow!("malformed poll payload: {e}")))?;
            poll_withdrawal_status(ctx, payload).await
        }
        QueueName::SendNotification => {
            // Rendering and delivery are external; the event is handed off
            // to the log sink the notification service consumes.
            info!(target: "notify", payload = %job.payload, "notification event");
            Ok(())
        }
        QueueName::IntegrationEvents => {
            // Opaque passthrough for repo-provisioning integrations.
            info!(target: "integrations", payload = %job.payload, "integration event");
            Ok(())
        }
    }
}

// ============================================================================
// ESCROW EVENT SYNCHRONIZER
// ============================================================================

/// Choose the block range for one sync run: explicit override, else one past
/// the watermark, else a fixed lookback from the chain head. None when there
/// is nothing to scan.
pub fn resolve_sync_range(
    override_from: Option<u64>,
    override_to: Option<u64>,
    watermark: Option<u64>,
    head: u64,
    lookback: u64,
) -> Option<(u64, u64)> {
    let to = override_to.unwrap_or(head);
    let from = override_from
        .or_else(|| watermark.map(|w| w + 1))
        .unwrap_or_else(|| to.saturating_sub(lookback));

    if from > to {
        return None;
    }
    Some((from, to))
}

/// Pull lifecycle events from the chain and advance local bounty state. The
/// whole batch commits atomically; any failure leaves the watermark where it
/// was so the next run retries the same window.
pub async fn sync_escrow_events(
    ctx: &WorkerContext,
    payload: SyncEscrowPayload,
) -> Result<(), JobError> {
    let head = match payload.to_block {
        Some(block) => block,
        None => ctx.chain.latest_block().await.map_err(retry)?,
    };

    let watermark = ctx.store.latest_event_block().await.map_err(retry)?;

    let Some((from, to)) = resolve_sync_range(
        payload.from_block,
        payload.to_block,
        watermark,
        head,
        ctx.config.chain.lookback_blocks,
    ) else {
        return Ok(());
    };

    let events = ctx
        .chain
        .fetch_escrow_events(from, to)
        .await
        .map_err(retry)?;

    let stats = ctx.store.sync_escrow_batch(&events).await.map_err(retry)?;

    if stats.events_inserted > 0 || stats.bounties_updated > 0 {
        info!(
            "Escrow sync [{}..{}]: {} new events, {} bounties updated",
            from, to, stats.events_inserted, stats.bounties_updated
        );
    }

    Ok(())
}

// ============================================================================
// BOUNTY EXPIRY RECONCILER
// ============================================================================

/// Sweep open bounties whose deadline plus grace period has elapsed.
pub async fn reconcile_bounty_state(ctx: &WorkerContext) -> Result<(), JobError> {
    let expired = ctx
        .store
        .expire_overdue_bounties(Utc::now())
        .await
        .map_err(retry)?;

    if !expired.is_empty() {
        info!("Expired {} overdue bounties: {:?}", expired.len(), expired);
    }

    Ok(())
}

// ============================================================================
// ORPHANED PAYOUT RECOVERY
// ============================================================================

/// Fail Circle payouts stuck pending with no external reference, evidence of
/// a crash between the ledger insert and the provider call.
pub async fn recover_orphaned_payouts(ctx: &WorkerContext) -> Result<(), JobError> {
    let orphaned = ctx.store.recover_orphaned_payouts().await.map_err(retry)?;

    if orphaned.is_empty() {
        info!("No orphaned payouts found");
    } else {
        info!(
            "Marked {} orphaned payout(s) as failed: {:?}",
            orphaned.len(),
            orphaned
        );
    }

    Ok(())
}

// ============================================================================
// WITHDRAWAL STATUS POLL
// ============================================================================

/// Poll the provider for a transfer's status. Returns a retryable error
/// while the transfer is still in flight, so the queue keeps polling on the
/// backoff curve until a terminal status lands (or a webhook beats us to it).
pub async fn poll_withdrawal_status(
    ctx: &WorkerContext,
    payload: WithdrawPollPayload,
) -> Result<(), JobError> {
    let raw_status = match ctx.circle.get_transfer_status(&payload.external_ref).await {
        Ok(status) => status,
        Err(ProviderError::MissingApiKey) => {
            return Err(JobError::Terminal(anyhow!("circle API key not configured")))
        }
        Err(e) => return Err(retry(e)),
    };

    let status = normalize_transfer_status(&raw_status);

    if let Some(transition) = ctx
        .store
        .update_payout_status(payload.payout_id, status)
        .await
        .map_err(retry)?
    {
        info!(
            "Payout {} moved to {} via status poll",
            transition.payout_id,
            transition.status.as_str()
        );
        if let Some(event) = notify::payout_event(&transition) {
            notify::emit(&ctx.queue, event).await;
        }
    }

    if !status.is_terminal() {
        warn!(
            "Transfer {} not terminal yet: {}",
            payload.external_ref, raw_status
        );
        return Err(JobError::Retry(anyhow!(
            "transfer {} still {}",
            payload.external_ref,
            raw_status
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_with_override() {
        assert_eq!(
            resolve_sync_range(Some(100), Some(200), Some(999), 5000, 5000),
            Some((100, 200))
        );
    }

    #[test]
    fn test_range_resumes_past_watermark() {
        assert_eq!(
            resolve_sync_range(None, None, Some(149), 200, 5000),
            Some((150, 200))
        );
    }

    #[test]
    fn test_range_lookback_when_no_events_yet() {
        assert_eq!(
            resolve_sync_range(None, None, None, 10_000, 5000),
            Some((5000, 10_000))
        );
        // lookback saturates at genesis
        assert_eq!(resolve_sync_range(None, None, None, 100, 5000), Some((0, 100)));
    }

    #[test]
    fn test_range_empty_window() {
        // watermark already at head: scan the head block once more is fine,
        // but one past it is not
        assert_eq!(resolve_sync_range(None, None, Some(200), 200, 5000), None);
        assert_eq!(
            resolve_sync_range(None, None, Some(199), 200, 5000),
            Some((200, 200))
        );
        assert_eq!(resolve_sync_range(Some(300), Some(200), None, 200, 5000), None);
    }
}
