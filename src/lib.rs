//! BountyView - escrow funding, winner claim, and payout reconciliation
//!
//! Employers escrow a USDC prize on-chain, candidates do the work, and the
//! prize is released as an internal ledger credit or a Circle transfer. This
//! crate is the engine in the middle: it verifies chain transactions against
//! expected business state, links them to bounty records exactly once,
//! computes withdrawable balances, drives Circle with idempotency keys, and
//! continuously reconciles chain/provider state against the local ledger.
//!
//! # Guarantees
//!
//! 1. A funding transaction links to at most one bounty, and a bounty's
//!    on-chain id is set at most once, however many requests race.
//! 2. Concurrent withdrawals can never overdraw a candidate's balance
//!    (per-candidate advisory lock around check-and-insert).
//! 3. Scheduled jobs are idempotent under at-least-once redelivery; the
//!    chain is the long-run source of truth and overrides local state.

pub mod amount;
pub mod audit;
pub mod chain;
pub mod circle;
pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod queue;
pub mod server;
pub mod store;
pub mod webhook;

pub use amount::Usdc;
pub use chain::{EscrowChainClient, VerifyError};
pub use circle::CircleClient;
pub use config::Config;
pub use error::ApiError;
pub use queue::{JobQueue, QueueName, RetryPolicy};
pub use store::PgStore;
