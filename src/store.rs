//! PostgreSQL store for the payout reconciliation engine
//!
//! All bounty, submission, funding, escrow-event, and payout state lives
//! here. Mutations follow the locking discipline the engine depends on:
//! conditional writes for exactly-once linkage, row locks for claim/cancel,
//! and a per-candidate advisory lock for withdrawals. No blind writes.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::NoTls;
use tracing::{debug, info};
use uuid::Uuid;

use crate::amount::Usdc;
use crate::chain::{DecodedEscrowEvent, EscrowEventKind};

/// Rejection reason applied to non-winning submissions when a winner is
/// selected.
pub const WINNER_SELECTED_REJECTION: &str = "Another submission was selected as the winner";

/// A Circle payout left pending without an external reference for longer
/// than this is evidence of a crash between ledger insert and provider call.
pub const ORPHANED_PAYOUT_THRESHOLD_MINUTES: i64 = 5;

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Employer,
    Candidate,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Employer => "employer",
            UserRole::Candidate => "candidate",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "employer" => Ok(UserRole::Employer),
            "candidate" => Ok(UserRole::Candidate),
            other => Err(anyhow!("unknown user role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    Open,
    Claimed,
    Cancelled,
    Expired,
}

impl BountyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BountyStatus::Open => "open",
            BountyStatus::Claimed => "claimed",
            BountyStatus::Cancelled => "cancelled",
            BountyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(BountyStatus::Open),
            "claimed" => Ok(BountyStatus::Claimed),
            "cancelled" => Ok(BountyStatus::Cancelled),
            "expired" => Ok(BountyStatus::Expired),
            other => Err(anyhow!("unknown bounty status: {other}")),
        }
    }

    /// Every status except `open` is terminal and never transitions again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BountyStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Rejected,
    Winner,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Winner => "winner",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "rejected" => Ok(ReviewStatus::Rejected),
            "winner" => Ok(ReviewStatus::Winner),
            other => Err(anyhow!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutProvider {
    /// Internal ledger credit created when a winner is claimed.
    SelfService,
    /// External transfer through Circle.
    Circle,
}

impl PayoutProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutProvider::SelfService => "self_service",
            PayoutProvider::Circle => "circle",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "self_service" => Ok(PayoutProvider::SelfService),
            "circle" => Ok(PayoutProvider::Circle),
            other => Err(anyhow!("unknown payout provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "processing" => Ok(PayoutStatus::Processing),
            "completed" => Ok(PayoutStatus::Completed),
            "failed" => Ok(PayoutStatus::Failed),
            "cancelled" => Ok(PayoutStatus::Cancelled),
            other => Err(anyhow!("unknown payout status: {other}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Completed | PayoutStatus::Failed | PayoutStatus::Cancelled
        )
    }
}

/// Terminal bounty status driven by an authoritative on-chain event, if the
/// event kind changes state at all.
pub fn terminal_status_for_event(kind: EscrowEventKind) -> Option<BountyStatus> {
    match kind {
        EscrowEventKind::Created => None,
        EscrowEventKind::Claimed => Some(BountyStatus::Claimed),
        EscrowEventKind::Cancelled => Some(BountyStatus::Cancelled),
        EscrowEventKind::Expired => Some(BountyStatus::Expired),
    }
}

// ============================================================================
// ROW TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub github_username: String,
    pub role: UserRole,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: Uuid,
    pub employer_id: Uuid,
    pub amount_usdc: Usdc,
    pub submission_deadline: DateTime<Utc>,
    pub grace_period_days: i32,
    pub status: BountyStatus,
    pub onchain_bounty_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bounty {
    /// Last instant at which the employer may still select a winner.
    pub fn claim_window_end(&self) -> DateTime<Utc> {
        self.submission_deadline + chrono::Duration::days(self.grace_period_days as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub bounty_id: Uuid,
    pub candidate_id: Uuid,
    pub review_status: ReviewStatus,
    pub is_winner: bool,
    pub rejection_reason: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRecord {
    pub id: Uuid,
    pub bounty_id: Uuid,
    pub tx_hash: String,
    pub chain_id: i32,
    pub escrow_amount: Usdc,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub submission_id: Option<Uuid>,
    pub candidate_id: Uuid,
    pub provider: PayoutProvider,
    pub status: PayoutStatus,
    pub amount_usdc: Usdc,
    pub external_ref: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// OPERATION OUTCOMES
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum FundingLinkOutcome {
    /// Funding record inserted and on-chain id set, both for the first time.
    Linked,
    /// The persisted state already equals the intended final state; the call
    /// is a successful idempotent retry.
    AlreadyLinked,
    /// The hash or the bounty is already linked elsewhere.
    Conflict,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimWinnerOutcome {
    Claimed { payout_id: Uuid, candidate_id: Uuid },
    NotFound,
    NotOpen,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelBountyOutcome {
    Cancelled { candidate_ids: Vec<Uuid> },
    NotFound,
    NotOpen,
    /// Every existing submission must carry an explicit rejection reason.
    RejectionsRequired,
}

#[derive(Debug)]
pub enum WithdrawalOutcome {
    Created(Payout),
    InsufficientBalance { available: Usdc },
}

/// A payout status change that actually took effect.
#[derive(Debug, Clone)]
pub struct PayoutTransition {
    pub payout_id: Uuid,
    pub candidate_id: Uuid,
    pub status: PayoutStatus,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub events_inserted: u64,
    pub bounties_updated: u64,
}

// ============================================================================
// PG STORE
// ============================================================================

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create the store from DATABASE_URL
    pub async fn new(database_url: &str) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Create the store from the DATABASE_URL environment variable
    pub async fn from_env() -> Result<Self> {
        let url =
            std::env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL not set"))?;
        Self::new(&url).await
    }

    /// The underlying pool, shared with the job queue.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;

        // Check if migrations table exists
        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            let migration_sql = include_str!("../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        // Check for job queue migration (version 2)
        let has_queue: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 2)",
                &[],
            )
            .await?
            .get(0);

        if !has_queue {
            let migration_sql = include_str!("../migrations/002_queue.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 002_queue");
        }

        Ok(())
    }

    // ========================================================================
    // USERS
    // ========================================================================

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, github_username, role, wallet_address FROM users WHERE id = $1",
                &[&user_id],
            )
            .await?;

        row.map(|r| {
            Ok(User {
                id: r.get(0),
                github_username: r.get(1),
                role: UserRole::parse(r.get(2))?,
                wallet_address: r.get(3),
            })
        })
        .transpose()
    }

    // ========================================================================
    // BOUNTIES
    // ========================================================================

    const BOUNTY_COLUMNS: &'static str =
        "id, employer_id, amount_usdc::text, submission_deadline, grace_period_days, status, onchain_bounty_id, created_at, updated_at";

    fn bounty_from_row(row: &tokio_postgres::Row) -> Result<Bounty> {
        Ok(Bounty {
            id: row.get(0),
            employer_id: row.get(1),
            amount_usdc: Usdc::parse(row.get(2))?,
            submission_deadline: row.get(3),
            grace_period_days: row.get(4),
            status: BountyStatus::parse(row.get(5))?,
            onchain_bounty_id: row.get(6),
            created_at: row.get(7),
            updated_at: row.get(8),
        })
    }

    pub async fn get_bounty(&self, bounty_id: Uuid) -> Result<Option<Bounty>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                &format!("SELECT {} FROM bounties WHERE id = $1", Self::BOUNTY_COLUMNS),
                &[&bounty_id],
            )
            .await?;

        row.as_ref().map(Self::bounty_from_row).transpose()
    }

    pub async fn get_bounty_for_employer(
        &self,
        bounty_id: Uuid,
        employer_id: Uuid,
    ) -> Result<Option<Bounty>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM bounties WHERE id = $1 AND employer_id = $2",
                    Self::BOUNTY_COLUMNS
                ),
                &[&bounty_id, &employer_id],
            )
            .await?;

        row.as_ref().map(Self::bounty_from_row).transpose()
    }

    // ========================================================================
    // FUNDING LINKER
    // ========================================================================

    pub async fn get_funding(&self, bounty_id: Uuid) -> Result<Option<FundingRecord>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, bounty_id, tx_hash, chain_id, escrow_amount::text, created_at
                 FROM bounty_funding WHERE bounty_id = $1",
                &[&bounty_id],
            )
            .await?;

        row.map(|r| {
            Ok(FundingRecord {
                id: r.get(0),
                bounty_id: r.get(1),
                tx_hash: r.get(2),
                chain_id: r.get(3),
                escrow_amount: Usdc::parse(r.get(4))?,
                created_at: r.get(5),
            })
        })
        .transpose()
    }

    /// Attach a verified funding transaction to a bounty, exactly once.
    ///
    /// Two conditional writes run in one transaction: an insert-if-absent on
    /// the funding record and an update-if-still-unset on the bounty's
    /// on-chain id. If either touches zero rows, the persisted state decides
    /// between idempotent retry and conflict.
    pub async fn link_funding(
        &self,
        bounty_id: Uuid,
        tx_hash: &str,
        chain_id: i32,
        escrow_amount: Usdc,
        onchain_bounty_id: &str,
    ) -> Result<FundingLinkOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = tx
            .execute(
                "INSERT INTO bounty_funding (bounty_id, tx_hash, chain_id, escrow_amount)
                 VALUES ($1, $2, $3, $4::text::numeric)
                 ON CONFLICT DO NOTHING",
                &[&bounty_id, &tx_hash, &chain_id, &escrow_amount.to_string()],
            )
            .await?;

        let updated = tx
            .execute(
                "UPDATE bounties SET onchain_bounty_id = $2, updated_at = now()
                 WHERE id = $1 AND onchain_bounty_id IS NULL",
                &[&bounty_id, &onchain_bounty_id],
            )
            .await?;

        if inserted == 1 && updated == 1 {
            tx.commit().await?;
            info!("Linked funding tx {} to bounty {}", tx_hash, bounty_id);
            return Ok(FundingLinkOutcome::Linked);
        }

        // A conditional write was a no-op. Re-read and decide.
        let row = tx
            .query_opt(
                "SELECT f.tx_hash, b.onchain_bounty_id
                 FROM bounties b
                 LEFT JOIN bounty_funding f ON f.bounty_id = b.id
                 WHERE b.id = $1",
                &[&bounty_id],
            )
            .await?;

        let (existing_hash, existing_onchain): (Option<String>, Option<String>) = match row {
            Some(r) => (r.get(0), r.get(1)),
            None => (None, None),
        };

        if existing_hash.as_deref() == Some(tx_hash)
            && existing_onchain.as_deref() == Some(onchain_bounty_id)
        {
            tx.commit().await?;
            debug!("Funding link retry for bounty {} absorbed", bounty_id);
            return Ok(FundingLinkOutcome::AlreadyLinked);
        }

        tx.rollback().await?;
        Ok(FundingLinkOutcome::Conflict)
    }

    // ========================================================================
    // SUBMISSIONS
    // ========================================================================

    pub async fn get_submission(&self, submission_id: Uuid) -> Result<Option<Submission>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, bounty_id, candidate_id, review_status, is_winner, rejection_reason, reviewed_at
                 FROM submissions WHERE id = $1",
                &[&submission_id],
            )
            .await?;

        row.map(|r| {
            Ok(Submission {
                id: r.get(0),
                bounty_id: r.get(1),
                candidate_id: r.get(2),
                review_status: ReviewStatus::parse(r.get(3))?,
                is_winner: r.get(4),
                rejection_reason: r.get(5),
                reviewed_at: r.get(6),
            })
        })
        .transpose()
    }

    // ========================================================================
    // WINNER CLAIM
    // ========================================================================

    /// Finalize a winner selection. One transaction: lock the bounty row,
    /// re-check it is still open, reject every other submission, mark the
    /// winner, set the bounty claimed, and insert the completed internal
    /// payout carrying the verified transaction metadata.
    pub async fn claim_winner(
        &self,
        bounty_id: Uuid,
        employer_id: Uuid,
        submission_id: Uuid,
        prize: Usdc,
        metadata: Value,
    ) -> Result<ClaimWinnerOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let locked = tx
            .query_opt(
                "SELECT status FROM bounties WHERE id = $1 AND employer_id = $2 FOR UPDATE",
                &[&bounty_id, &employer_id],
            )
            .await?;

        let status = match locked {
            Some(row) => BountyStatus::parse(row.get(0))?,
            None => return Ok(ClaimWinnerOutcome::NotFound),
        };

        if status != BountyStatus::Open {
            return Ok(ClaimWinnerOutcome::NotOpen);
        }

        let submission = tx
            .query_opt(
                "SELECT candidate_id FROM submissions WHERE id = $1 AND bounty_id = $2 FOR UPDATE",
                &[&submission_id, &bounty_id],
            )
            .await?;

        let candidate_id: Uuid = match submission {
            Some(row) => row.get(0),
            None => return Ok(ClaimWinnerOutcome::NotFound),
        };

        tx.execute(
            "UPDATE submissions
             SET review_status = 'rejected', is_winner = false, rejection_reason = $2,
                 reviewed_at = now(), updated_at = now()
             WHERE bounty_id = $1 AND id <> $3",
            &[&bounty_id, &WINNER_SELECTED_REJECTION, &submission_id],
        )
        .await?;

        tx.execute(
            "UPDATE submissions
             SET review_status = 'winner', is_winner = true, rejection_reason = NULL,
                 reviewed_at = now(), updated_at = now()
             WHERE id = $1",
            &[&submission_id],
        )
        .await?;

        tx.execute(
            "UPDATE bounties SET status = 'claimed', updated_at = now() WHERE id = $1",
            &[&bounty_id],
        )
        .await?;

        let payout_row = tx
            .query_one(
                "INSERT INTO payouts (submission_id, candidate_id, provider, status, amount_usdc, metadata)
                 VALUES ($1, $2, 'self_service', 'completed', $3::text::numeric, $4)
                 RETURNING id",
                &[&submission_id, &candidate_id, &prize.to_string(), &metadata],
            )
            .await?;

        tx.commit().await?;

        let payout_id: Uuid = payout_row.get(0);
        info!(
            "Bounty {} claimed: winner submission {}, payout {}",
            bounty_id, submission_id, payout_id
        );

        Ok(ClaimWinnerOutcome::Claimed {
            payout_id,
            candidate_id,
        })
    }

    // ========================================================================
    // CANCELLATION
    // ========================================================================

    /// Cancel an open bounty. Every existing submission must carry an
    /// explicit rejection reason; all are rejected in the same transaction
    /// that flips the bounty to cancelled.
    pub async fn cancel_bounty(
        &self,
        bounty_id: Uuid,
        employer_id: Uuid,
        rejections: &std::collections::HashMap<Uuid, String>,
    ) -> Result<CancelBountyOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let locked = tx
            .query_opt(
                "SELECT status FROM bounties WHERE id = $1 AND employer_id = $2 FOR UPDATE",
                &[&bounty_id, &employer_id],
            )
            .await?;

        let status = match locked {
            Some(row) => BountyStatus::parse(row.get(0))?,
            None => return Ok(CancelBountyOutcome::NotFound),
        };

        if status != BountyStatus::Open {
            return Ok(CancelBountyOutcome::NotOpen);
        }

        let submission_rows = tx
            .query(
                "SELECT id, candidate_id FROM submissions WHERE bounty_id = $1 FOR UPDATE",
                &[&bounty_id],
            )
            .await?;

        let existing: Vec<(Uuid, Uuid)> = submission_rows
            .iter()
            .map(|r| (r.get(0), r.get(1)))
            .collect();

        if existing.len() != rejections.len()
            || existing.iter().any(|(id, _)| !rejections.contains_key(id))
        {
            return Ok(CancelBountyOutcome::RejectionsRequired);
        }

        for (submission_id, _) in &existing {
            let reason = &rejections[submission_id];
            tx.execute(
                "UPDATE submissions
                 SET review_status = 'rejected', is_winner = false, rejection_reason = $2,
                     reviewed_at = now(), updated_at = now()
                 WHERE id = $1",
                &[submission_id, reason],
            )
            .await?;
        }

        tx.execute(
            "UPDATE bounties SET status = 'cancelled', updated_at = now() WHERE id = $1",
            &[&bounty_id],
        )
        .await?;

        tx.commit().await?;
        info!("Bounty {} cancelled", bounty_id);

        Ok(CancelBountyOutcome::Cancelled {
            candidate_ids: existing.into_iter().map(|(_, candidate)| candidate).collect(),
        })
    }

    // ========================================================================
    // WITHDRAWAL LEDGER
    // ========================================================================

    const BALANCE_SQL: &'static str =
        "SELECT
            COALESCE(SUM(CASE WHEN provider = 'self_service' AND status = 'completed'
                              THEN amount_usdc ELSE 0 END), 0)::text AS earned,
            COALESCE(SUM(CASE WHEN provider = 'circle' AND status IN ('pending', 'processing', 'completed')
                              THEN amount_usdc ELSE 0 END), 0)::text AS withdrawn
         FROM payouts
         WHERE candidate_id = $1";

    /// Spendable balance: completed internal credits minus external payouts
    /// that are pending, processing, or completed.
    pub async fn candidate_balance(&self, candidate_id: Uuid) -> Result<Usdc> {
        let client = self.pool.get().await?;
        let row = client.query_one(Self::BALANCE_SQL, &[&candidate_id]).await?;
        balance_from_totals(row.get(0), row.get(1))
    }

    /// Insert a pending external payout after checking the balance, all
    /// under a per-candidate advisory lock so concurrent withdrawals cannot
    /// overdraw.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_withdrawal(
        &self,
        candidate_id: Uuid,
        amount: Usdc,
        requested_amount: Usdc,
        idempotency_key: &str,
        bank_account_id: &str,
        destination_currency: &str,
    ) -> Result<WithdrawalOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serializes all withdrawal attempts for this candidate across every
        // server process; released at commit/rollback.
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            &[&candidate_id.to_string()],
        )
        .await?;

        let row = tx.query_one(Self::BALANCE_SQL, &[&candidate_id]).await?;
        let available = balance_from_totals(row.get(0), row.get(1))?;

        if amount > available {
            return Ok(WithdrawalOutcome::InsufficientBalance { available });
        }

        let metadata = serde_json::json!({
            "idempotency_key": idempotency_key,
            "requested_amount_usdc": requested_amount.to_string(),
            "transfer_amount_usd2": amount.as_usd2_string(),
            "bank_account_id": bank_account_id,
            "destination_currency": destination_currency,
        });

        let inserted = tx
            .query_one(
                "INSERT INTO payouts (candidate_id, provider, status, amount_usdc, external_ref, metadata)
                 VALUES ($1, 'circle', 'pending', $2::text::numeric, NULL, $3)
                 RETURNING id, submission_id, candidate_id, provider, status, amount_usdc::text,
                           external_ref, metadata, created_at, updated_at",
                &[&candidate_id, &amount.to_string(), &metadata],
            )
            .await?;

        tx.commit().await?;

        Ok(WithdrawalOutcome::Created(Self::payout_from_row(&inserted)?))
    }

    fn payout_from_row(row: &tokio_postgres::Row) -> Result<Payout> {
        Ok(Payout {
            id: row.get(0),
            submission_id: row.get(1),
            candidate_id: row.get(2),
            provider: PayoutProvider::parse(row.get(3))?,
            status: PayoutStatus::parse(row.get(4))?,
            amount_usdc: Usdc::parse(row.get(5))?,
            external_ref: row.get(6),
            metadata: row
                .get::<_, Option<Value>>(7)
                .unwrap_or(Value::Null),
            created_at: row.get(8),
            updated_at: row.get(9),
        })
    }

    pub async fn list_payouts(&self, candidate_id: Uuid) -> Result<Vec<Payout>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT id, submission_id, candidate_id, provider, status, amount_usdc::text,
                        external_ref, metadata, created_at, updated_at
                 FROM payouts
                 WHERE candidate_id = $1
                 ORDER BY created_at DESC",
                &[&candidate_id],
            )
            .await?;

        rows.iter().map(Self::payout_from_row).collect()
    }

    /// Record the provider's response to a transfer call. Only non-terminal
    /// payouts move.
    pub async fn update_payout_after_transfer(
        &self,
        payout_id: Uuid,
        external_ref: &str,
        status: PayoutStatus,
    ) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .execute(
                "UPDATE payouts SET external_ref = $2, status = $3, updated_at = now()
                 WHERE id = $1 AND status IN ('pending', 'processing')",
                &[&payout_id, &external_ref, &status.as_str()],
            )
            .await?;

        Ok(())
    }

    /// A payout is never left pending after a failed provider call.
    pub async fn mark_payout_failed(&self, payout_id: Uuid, reason: &str) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .execute(
                "UPDATE payouts
                 SET status = 'failed',
                     metadata = COALESCE(metadata, '{}'::jsonb) || jsonb_build_object('failure_reason', $2::text),
                     updated_at = now()
                 WHERE id = $1 AND status IN ('pending', 'processing')",
                &[&payout_id, &reason],
            )
            .await?;

        Ok(())
    }

    /// Advance a payout's status from a poll result. Returns the transition
    /// if the status actually changed.
    pub async fn update_payout_status(
        &self,
        payout_id: Uuid,
        status: PayoutStatus,
    ) -> Result<Option<PayoutTransition>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "UPDATE payouts SET status = $2, updated_at = now()
                 WHERE id = $1 AND status IN ('pending', 'processing') AND status <> $2
                 RETURNING id, candidate_id",
                &[&payout_id, &status.as_str()],
            )
            .await?;

        Ok(row.map(|r| PayoutTransition {
            payout_id: r.get(0),
            candidate_id: r.get(1),
            status,
        }))
    }

    /// Apply a webhook-reported status by external reference. The guard makes
    /// redelivered webhooks no-ops: only a real forward transition returns a
    /// row, so notification policy dedupes by transition, not by delivery.
    pub async fn apply_webhook_status(
        &self,
        external_ref: &str,
        status: PayoutStatus,
        webhook_payload: &Value,
    ) -> Result<Option<PayoutTransition>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "UPDATE payouts
                 SET status = $2,
                     metadata = COALESCE(metadata, '{}'::jsonb) || jsonb_build_object('last_webhook', $3::jsonb),
                     updated_at = now()
                 WHERE external_ref = $1 AND status IN ('pending', 'processing') AND status <> $2
                 RETURNING id, candidate_id",
                &[&external_ref, &status.as_str(), &webhook_payload],
            )
            .await?;

        Ok(row.map(|r| PayoutTransition {
            payout_id: r.get(0),
            candidate_id: r.get(1),
            status,
        }))
    }

    // ========================================================================
    // ESCROW EVENT SYNCHRONIZER
    // ========================================================================

    /// Highest block number with a recorded event; the sync watermark.
    pub async fn latest_event_block(&self) -> Result<Option<u64>> {
        let client = self.pool.get().await?;

        let row = client
            .query_one("SELECT MAX(block_number) FROM escrow_events", &[])
            .await?;

        let max: Option<i64> = row.get(0);
        Ok(max.map(|b| b as u64))
    }

    /// Insert a batch of decoded events and advance bounty state, atomically.
    /// Duplicate deliveries across overlapping windows are absorbed by the
    /// (tx_hash, event_kind) uniqueness. State-changing kinds update the
    /// matching bounty unconditionally: the chain is authoritative and may
    /// override client-reported state. A mid-run failure aborts the whole
    /// batch, leaving the watermark unadvanced for the next attempt.
    pub async fn sync_escrow_batch(&self, events: &[DecodedEscrowEvent]) -> Result<SyncStats> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut stats = SyncStats::default();

        for event in events {
            let inserted = tx
                .execute(
                    "INSERT INTO escrow_events (onchain_bounty_id, event_kind, tx_hash, block_number, payload)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (tx_hash, event_kind) DO NOTHING",
                    &[
                        &event.onchain_bounty_id,
                        &event.kind.db_name(),
                        &event.tx_hash,
                        &(event.block_number as i64),
                        &event.payload,
                    ],
                )
                .await?;
            stats.events_inserted += inserted;

            if let Some(status) = terminal_status_for_event(event.kind) {
                let updated = tx
                    .execute(
                        "UPDATE bounties SET status = $2, updated_at = now()
                         WHERE onchain_bounty_id = $1 AND status <> $2",
                        &[&event.onchain_bounty_id, &status.as_str()],
                    )
                    .await?;
                stats.bounties_updated += updated;
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    // ========================================================================
    // RECONCILIATION SWEEPS
    // ========================================================================

    /// Expire open bounties whose deadline plus grace period has elapsed.
    /// The status guard avoids clobbering a concurrent claim or cancel.
    pub async fn expire_overdue_bounties(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "UPDATE bounties SET status = 'expired', updated_at = now()
                 WHERE status = 'open'
                   AND submission_deadline + make_interval(days => grace_period_days) < $1
                 RETURNING id",
                &[&now],
            )
            .await?;

        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Fail Circle payouts stuck pending with no external reference past the
    /// staleness threshold, freeing the candidate's reserved balance.
    pub async fn recover_orphaned_payouts(&self) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                &format!(
                    "UPDATE payouts
                     SET status = 'failed',
                         metadata = COALESCE(metadata, '{{}}'::jsonb) || '{{\"failure_reason\":\"orphan_recovery\"}}'::jsonb,
                         updated_at = now()
                     WHERE provider = 'circle'
                       AND status = 'pending'
                       AND external_ref IS NULL
                       AND created_at < now() - interval '{} minutes'
                     RETURNING id",
                    ORPHANED_PAYOUT_THRESHOLD_MINUTES
                ),
                &[],
            )
            .await?;

        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}

fn balance_from_totals(earned: &str, withdrawn: &str) -> Result<Usdc> {
    let earned = Usdc::parse(earned)?;
    let withdrawn = Usdc::parse(withdrawn)?;
    earned
        .checked_sub(withdrawn)
        .ok_or_else(|| anyhow!("balance underflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips() {
        for status in [
            BountyStatus::Open,
            BountyStatus::Claimed,
            BountyStatus::Cancelled,
            BountyStatus::Expired,
        ] {
            assert_eq!(BountyStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            PayoutStatus::Pending,
            PayoutStatus::Processing,
            PayoutStatus::Completed,
            PayoutStatus::Failed,
            PayoutStatus::Cancelled,
        ] {
            assert_eq!(PayoutStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(BountyStatus::parse("reopened").is_err());
        assert!(PayoutStatus::parse("done").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BountyStatus::Open.is_terminal());
        assert!(BountyStatus::Claimed.is_terminal());
        assert!(BountyStatus::Cancelled.is_terminal());
        assert!(BountyStatus::Expired.is_terminal());

        assert!(!PayoutStatus::Pending.is_terminal());
        assert!(!PayoutStatus::Processing.is_terminal());
        assert!(PayoutStatus::Completed.is_terminal());
        assert!(PayoutStatus::Failed.is_terminal());
        assert!(PayoutStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_event_kind_to_terminal_status() {
        assert_eq!(terminal_status_for_event(EscrowEventKind::Created), None);
        assert_eq!(
            terminal_status_for_event(EscrowEventKind::Claimed),
            Some(BountyStatus::Claimed)
        );
        assert_eq!(
            terminal_status_for_event(EscrowEventKind::Cancelled),
            Some(BountyStatus::Cancelled)
        );
        assert_eq!(
            terminal_status_for_event(EscrowEventKind::Expired),
            Some(BountyStatus::Expired)
        );
    }

    #[test]
    fn test_claim_window_end() {
        let deadline = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let bounty = Bounty {
            id: Uuid::nil(),
            employer_id: Uuid::nil(),
            amount_usdc: Usdc::from_units(0),
            submission_deadline: deadline,
            grace_period_days: 7,
            status: BountyStatus::Open,
            onchain_bounty_id: None,
            created_at: deadline,
            updated_at: deadline,
        };
        assert_eq!(
            bounty.claim_window_end(),
            deadline + chrono::Duration::days(7)
        );
    }

    #[test]
    fn test_balance_from_totals() {
        let balance = balance_from_totals("500.000000", "200.000000").unwrap();
        assert_eq!(balance, Usdc::parse("300.000000").unwrap());

        // integer totals from COALESCE(..., 0) parse too
        let balance = balance_from_totals("0", "0").unwrap();
        assert_eq!(balance, Usdc::ZERO);
    }
}
