//! HTTP API server
//!
//! Synchronous endpoints for funding links, winner claims, cancellations,
//! and withdrawals, plus the HMAC-gated webhook receivers. Session handling
//! and role resolution live upstream; the gateway injects the authenticated
//! identity as `x-user-id` / `x-user-role` headers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::amount::canonicalize_request_amount;
use crate::audit::{write_audit, AuditAction};
use crate::chain::EscrowChainClient;
use crate::circle::{normalize_transfer_status, CircleClient, TransferRequest};
use crate::config::Config;
use crate::error::ApiError;
use crate::jobs::{SyncEscrowPayload, WithdrawPollPayload};
use crate::notify::{self, NotificationEvent, NotificationKind};
use crate::queue::{JobQueue, QueueName};
use crate::store::{
    BountyStatus, CancelBountyOutcome, ClaimWinnerOutcome, FundingLinkOutcome, PgStore, UserRole,
    WithdrawalOutcome,
};
use crate::webhook;

pub struct AppState {
    pub store: PgStore,
    pub chain: EscrowChainClient,
    pub circle: CircleClient,
    pub queue: JobQueue,
    pub config: Config,
    pub circle_webhook_secret: Option<String>,
    pub github_webhook_secret: Option<String>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/bounties/:id/fund", post(fund_bounty_handler))
        .route("/api/bounties/:id/claim-winner", post(claim_winner_handler))
        .route("/api/bounties/:id/cancel", post(cancel_bounty_handler))
        .route("/api/wallet/withdraw", post(withdraw_handler))
        .route("/api/wallet/payouts", get(payouts_handler))
        .route("/api/webhooks/circle", post(circle_webhook_handler))
        .route("/api/webhooks/github", post(github_webhook_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// IDENTITY
// ============================================================================

/// The authenticated identity, resolved upstream and injected per request.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser {
    pub id: Uuid,
    pub role: UserRole,
}

impl AuthedUser {
    fn require_role(&self, role: UserRole) -> Result<(), ApiError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "Requires {} role",
                role.as_str()
            )))
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let id = header("x-user-id")
            .and_then(|v| Uuid::parse_str(&v).ok())
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;

        let role = header("x-user-role")
            .and_then(|v| UserRole::parse(&v).ok())
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;

        Ok(AuthedUser { id, role })
    }
}

// ============================================================================
// INPUT VALIDATION
// ============================================================================

fn is_tx_hash(value: &str) -> bool {
    value.len() == 66
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn is_eth_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn require_tx_hash(value: &str) -> Result<String, ApiError> {
    if is_tx_hash(value) {
        Ok(value.to_lowercase())
    } else {
        Err(ApiError::Validation("Invalid transaction hash".to_string()))
    }
}

// ============================================================================
// HEALTH
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_secs: u64,
    version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// POST /api/bounties/:id/fund - Funding Linker
// ============================================================================

#[derive(Debug, Deserialize)]
struct FundBountyRequest {
    tx_hash: String,
}

async fn fund_bounty_handler(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Path(bounty_id): Path<Uuid>,
    Json(request): Json<FundBountyRequest>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(UserRole::Employer)?;
    let tx_hash = require_tx_hash(&request.tx_hash)?;

    let bounty = state
        .store
        .get_bounty_for_employer(bounty_id, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Bounty not found".to_string()))?;

    if bounty.status != BountyStatus::Open {
        return Err(ApiError::Conflict("Bounty is not open".to_string()));
    }

    let escrow_amount = bounty
        .amount_usdc
        .with_fee(state.config.fees.fee_bps)
        .map_err(|e| ApiError::Internal(e.into()))?;

    // Already linked: absorb a retry with the same hash, reject anything else.
    if let Some(onchain_bounty_id) = &bounty.onchain_bounty_id {
        let funding = state.store.get_funding(bounty.id).await?;
        return match funding {
            Some(record) if record.tx_hash == tx_hash => Ok(Json(json!({
                "ok": true,
                "onchain_bounty_id": onchain_bounty_id,
            }))),
            _ => Err(ApiError::Conflict(
                "Bounty is already funded by a different transaction".to_string(),
            )),
        };
    }

    let deadline_unix = u64::try_from(bounty.submission_deadline.timestamp())
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("deadline before epoch")))?;
    let expected_units = escrow_amount
        .token_units()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("negative escrow amount")))?;

    let employer = state.store.get_user(user.id).await?;
    let employer_address = employer.and_then(|u| u.wallet_address);

    let confirmation = state
        .chain
        .verify_funding(
            &tx_hash,
            expected_units,
            deadline_unix,
            employer_address.as_deref(),
        )
        .await
        .map_err(ApiError::from_verify)?;

    let outcome = state
        .store
        .link_funding(
            bounty.id,
            &tx_hash,
            state.config.chain.chain_id,
            escrow_amount,
            &confirmation.onchain_bounty_id,
        )
        .await?;

    match outcome {
        FundingLinkOutcome::Linked | FundingLinkOutcome::AlreadyLinked => {
            if let Err(e) = state
                .queue
                .enqueue(
                    QueueName::SyncEscrowEvents,
                    serde_json::to_value(SyncEscrowPayload {
                        trigger: Some("manual_funding".to_string()),
                        bounty_id: Some(bounty.id),
                        tx_hash: Some(tx_hash.clone()),
                        ..Default::default()
                    })
                    .unwrap_or_default(),
                )
                .await
            {
                warn!("Failed to enqueue escrow sync after funding: {}", e);
            }

            write_audit(
                AuditAction::BountyFunded,
                json!({
                    "bounty_id": bounty.id,
                    "employer_id": user.id,
                    "tx_hash": tx_hash,
                    "onchain_bounty_id": confirmation.onchain_bounty_id,
                    "escrow_amount_usdc": escrow_amount.to_string(),
                }),
            );

            Ok(Json(json!({
                "ok": true,
                "onchain_bounty_id": confirmation.onchain_bounty_id,
            })))
        }
        FundingLinkOutcome::Conflict => Err(ApiError::Conflict(
            "Transaction hash is already linked to another bounty".to_string(),
        )),
    }
}

// ============================================================================
// POST /api/bounties/:id/claim-winner - Winner Claim Processor
// ============================================================================

#[derive(Debug, Deserialize)]
struct ClaimWinnerRequest {
    submission_id: Uuid,
    winner_address: String,
    tx_hash: String,
}

async fn claim_winner_handler(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Path(bounty_id): Path<Uuid>,
    Json(request): Json<ClaimWinnerRequest>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(UserRole::Employer)?;

    if !is_eth_address(&request.winner_address) {
        return Err(ApiError::Validation("Invalid winner address".to_string()));
    }
    let tx_hash = require_tx_hash(&request.tx_hash)?;

    let bounty = state
        .store
        .get_bounty_for_employer(bounty_id, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Bounty not found".to_string()))?;

    if bounty.status != BountyStatus::Open {
        return Err(ApiError::Conflict("Bounty is not open".to_string()));
    }

    if chrono::Utc::now() > bounty.claim_window_end() {
        return Err(ApiError::Conflict(
            "Claim window has closed for this bounty".to_string(),
        ));
    }

    let onchain_bounty_id = bounty.onchain_bounty_id.clone().ok_or_else(|| {
        ApiError::Conflict("Bounty funding is not confirmed on-chain".to_string())
    })?;

    let submission = state
        .store
        .get_submission(request.submission_id)
        .await?
        .filter(|s| s.bounty_id == bounty.id)
        .ok_or_else(|| ApiError::NotFound("Submission not found".to_string()))?;

    let candidate = state
        .store
        .get_user(submission.candidate_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Candidate not found".to_string()))?;

    let payout_address = candidate.wallet_address.as_deref().ok_or_else(|| {
        ApiError::Validation("Candidate has no registered payout address".to_string())
    })?;

    if !payout_address.eq_ignore_ascii_case(&request.winner_address) {
        return Err(ApiError::Validation(
            "Winner address does not match the candidate's payout address".to_string(),
        ));
    }

    let expected_id: u128 = onchain_bounty_id
        .parse()
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("malformed on-chain bounty id")))?;
    let expected_units = bounty
        .amount_usdc
        .token_units()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("negative prize amount")))?;

    let confirmation = state
        .chain
        .verify_claim(&tx_hash, expected_id, &request.winner_address, expected_units)
        .await
        .map_err(ApiError::from_verify)?;

    let metadata = json!({
        "winner_address": request.winner_address.to_lowercase(),
        "onchain": {
            "bounty_id": onchain_bounty_id,
            "tx_hash": confirmation.tx_hash,
            "block_number": confirmation.block_number,
        },
    });

    let outcome = state
        .store
        .claim_winner(
            bounty.id,
            user.id,
            submission.id,
            bounty.amount_usdc,
            metadata,
        )
        .await?;

    match outcome {
        ClaimWinnerOutcome::Claimed {
            payout_id,
            candidate_id,
        } => {
            write_audit(
                AuditAction::BountyClaimed,
                json!({
                    "bounty_id": bounty.id,
                    "submission_id": submission.id,
                    "employer_id": user.id,
                    "winner_address": request.winner_address.to_lowercase(),
                    "payout_id": payout_id,
                }),
            );

            notify::emit(
                &state.queue,
                NotificationEvent {
                    kind: NotificationKind::WinnerSelected,
                    candidate_id,
                    bounty_id: Some(bounty.id),
                    payout_id: Some(payout_id),
                },
            )
            .await;

            Ok(Json(json!({
                "ok": true,
                "submission_id": submission.id,
                "payout_id": payout_id,
            })))
        }
        ClaimWinnerOutcome::NotFound => {
            Err(ApiError::NotFound("Submission not found".to_string()))
        }
        ClaimWinnerOutcome::NotOpen => {
            Err(ApiError::Conflict("Bounty is not open".to_string()))
        }
    }
}

// ============================================================================
// POST /api/bounties/:id/cancel - Bounty cancellation
// ============================================================================

#[derive(Debug, Deserialize)]
struct RejectionItem {
    submission_id: Uuid,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CancelBountyRequest {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    rejections: Vec<RejectionItem>,
}

async fn cancel_bounty_handler(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Path(bounty_id): Path<Uuid>,
    Json(request): Json<CancelBountyRequest>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(UserRole::Employer)?;

    for rejection in &request.rejections {
        if rejection.reason.len() < 3 || rejection.reason.len() > 1000 {
            return Err(ApiError::Validation(
                "Rejection reasons must be between 3 and 1000 characters".to_string(),
            ));
        }
    }

    let bounty = state
        .store
        .get_bounty_for_employer(bounty_id, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Bounty not found".to_string()))?;

    if bounty.status != BountyStatus::Open {
        return Err(ApiError::Conflict(
            "Only open bounties can be cancelled".to_string(),
        ));
    }

    // A funded bounty needs its on-chain cancellation verified first.
    if let Some(onchain_bounty_id) = &bounty.onchain_bounty_id {
        let tx_hash = request.tx_hash.as_deref().ok_or_else(|| {
            ApiError::Validation(
                "Cancellation tx_hash is required for funded bounties".to_string(),
            )
        })?;
        let tx_hash = require_tx_hash(tx_hash)?;

        let expected_id: u128 = onchain_bounty_id
            .parse()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("malformed on-chain bounty id")))?;

        state
            .chain
            .verify_cancel(&tx_hash, expected_id)
            .await
            .map_err(ApiError::from_verify)?;
    }

    let rejections: std::collections::HashMap<Uuid, String> = request
        .rejections
        .iter()
        .map(|r| (r.submission_id, r.reason.clone()))
        .collect();

    let outcome = state
        .store
        .cancel_bounty(bounty.id, user.id, &rejections)
        .await?;

    match outcome {
        CancelBountyOutcome::Cancelled { candidate_ids } => {
            write_audit(
                AuditAction::BountyCancelled,
                json!({
                    "bounty_id": bounty.id,
                    "employer_id": user.id,
                    "tx_hash": request.tx_hash,
                    "rejected_submission_count": rejections.len(),
                }),
            );

            for candidate_id in candidate_ids {
                notify::emit(
                    &state.queue,
                    NotificationEvent {
                        kind: NotificationKind::BountyCancelled,
                        candidate_id,
                        bounty_id: Some(bounty.id),
                        payout_id: None,
                    },
                )
                .await;
            }

            Ok(Json(json!({ "ok": true })))
        }
        CancelBountyOutcome::NotFound => Err(ApiError::NotFound("Bounty not found".to_string())),
        CancelBountyOutcome::NotOpen => Err(ApiError::Conflict(
            "Only open bounties can be cancelled".to_string(),
        )),
        CancelBountyOutcome::RejectionsRequired => Err(ApiError::Conflict(
            "All current submissions must be explicitly rejected to cancel".to_string(),
        )),
    }
}

// ============================================================================
// POST /api/wallet/withdraw - Withdrawal Ledger
// ============================================================================

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    amount_usdc: f64,
    bank_account_id: String,
    #[serde(default = "default_currency")]
    destination_currency: String,
}

async fn withdraw_handler(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Json(request): Json<WithdrawRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(UserRole::Candidate)?;

    if request.bank_account_id.is_empty() {
        return Err(ApiError::Validation("Missing bank account".to_string()));
    }
    if request.destination_currency.len() != 3 {
        return Err(ApiError::Validation(
            "Destination currency must be a 3-letter code".to_string(),
        ));
    }

    let requested = canonicalize_request_amount(request.amount_usdc)
        .map_err(|_| ApiError::Validation("Invalid withdrawal amount".to_string()))?;

    // Floored before the balance check and before the provider call, so the
    // booked amount never exceeds what can actually be transferred.
    let amount = requested.floor_to_cents();
    if !amount.is_positive() {
        return Err(ApiError::Validation("Invalid withdrawal amount".to_string()));
    }

    let idempotency_key = Uuid::new_v4().to_string();

    let outcome = state
        .store
        .create_withdrawal(
            user.id,
            amount,
            requested,
            &idempotency_key,
            &request.bank_account_id,
            &request.destination_currency,
        )
        .await?;

    let mut payout = match outcome {
        WithdrawalOutcome::Created(payout) => payout,
        WithdrawalOutcome::InsufficientBalance { available } => {
            info!(
                "Withdrawal rejected for {}: requested {} > available {}",
                user.id, amount, available
            );
            return Err(ApiError::Conflict(
                "Requested amount exceeds available winnings".to_string(),
            ));
        }
    };

    write_audit(
        AuditAction::CircleWithdrawRequested,
        json!({
            "payout_id": payout.id,
            "candidate_id": user.id,
            "requested_amount_usdc": requested.to_string(),
            "transfer_amount_usd2": amount.as_usd2_string(),
        }),
    );

    let transfer_result = state
        .circle
        .create_withdrawal(TransferRequest {
            idempotency_key: &idempotency_key,
            amount_usd2: &amount.as_usd2_string(),
            bank_account_id: &request.bank_account_id,
            destination_currency: &request.destination_currency,
        })
        .await;

    match transfer_result {
        Ok(transfer) => {
            let status = normalize_transfer_status(&transfer.status);
            state
                .store
                .update_payout_after_transfer(payout.id, &transfer.id, status)
                .await?;
            payout.external_ref = Some(transfer.id.clone());
            payout.status = status;

            let poll_payload = WithdrawPollPayload {
                payout_id: payout.id,
                external_ref: transfer.id,
            };
            if let Err(e) = state
                .queue
                .enqueue(
                    QueueName::CircleWithdrawStatusPoll,
                    serde_json::to_value(&poll_payload).unwrap_or_default(),
                )
                .await
            {
                warn!("Failed to enqueue withdrawal status poll: {}", e);
            }

            Ok((StatusCode::CREATED, Json(json!({ "payout": payout }))))
        }
        Err(e) => {
            // Never leave the payout pending after a failed provider call.
            state
                .store
                .mark_payout_failed(payout.id, "provider_call_failed")
                .await?;
            Err(ApiError::Provider(e.into()))
        }
    }
}

// ============================================================================
// GET /api/wallet/payouts
// ============================================================================

async fn payouts_handler(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    user.require_role(UserRole::Candidate)?;

    let payouts = state.store.list_payouts(user.id).await?;
    let available = state.store.candidate_balance(user.id).await?;

    Ok(Json(json!({
        "payouts": payouts,
        "available_balance_usdc": available.to_string(),
    })))
}

// ============================================================================
// WEBHOOKS
// ============================================================================

async fn circle_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .circle_webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("Webhook secret not configured".to_string()))?;

    let signature = headers
        .get("x-circle-signature")
        .or_else(|| headers.get("circle-signature"))
        .and_then(|v| v.to_str().ok());

    if !webhook::verify_circle_signature(secret, &body, signature) {
        return Err(ApiError::Unauthorized("Invalid signature".to_string()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("Invalid JSON".to_string()))?;

    let transfer_id = payload["transfer"]["id"].as_str();
    let raw_status = payload["transfer"]["status"].as_str();

    let (Some(transfer_id), Some(raw_status)) = (transfer_id, raw_status) else {
        // Not a transfer notification; acknowledge and move on.
        return Ok(Json(json!({ "ok": true })));
    };

    let status = normalize_transfer_status(raw_status);

    let transition = state
        .store
        .apply_webhook_status(transfer_id, status, &payload)
        .await?;

    if let Some(transition) = transition {
        info!(
            "Payout {} moved to {} via webhook",
            transition.payout_id,
            transition.status.as_str()
        );
        // Fire-and-forget: a notification failure must not trigger
        // provider-side redelivery.
        if let Some(event) = notify::payout_event(&transition) {
            notify::emit(&state.queue, event).await;
        }
    }

    Ok(Json(json!({ "ok": true })))
}

async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .github_webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("Webhook secret not configured".to_string()))?;

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());

    if !webhook::verify_github_signature(secret, &body, signature) {
        return Err(ApiError::Unauthorized("Invalid signature".to_string()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("Invalid JSON".to_string()))?;

    let delivery = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok());
    let event = headers.get("x-github-event").and_then(|v| v.to_str().ok());

    // Handed off to the repo-provisioning integration consumers.
    state
        .queue
        .enqueue(
            QueueName::IntegrationEvents,
            json!({
                "source": "github_webhook",
                "delivery": delivery,
                "event": event,
                "payload": payload,
            }),
        )
        .await?;

    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// SERVER
// ============================================================================

/// Run the server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting BountyView API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_hash_validation() {
        let valid = format!("0x{}", "a1".repeat(32));
        assert!(is_tx_hash(&valid));
        assert_eq!(
            require_tx_hash(&valid.to_uppercase().replace("0X", "0x")).unwrap(),
            valid
        );

        assert!(!is_tx_hash("0x1234"));
        assert!(!is_tx_hash(&format!("0x{}", "g".repeat(64))));
        assert!(!is_tx_hash(&"a".repeat(66)));
        assert!(require_tx_hash("0xdead").is_err());
    }

    #[test]
    fn test_eth_address_validation() {
        assert!(is_eth_address("0x1111111111111111111111111111111111111111"));
        assert!(is_eth_address("0xAbCd111111111111111111111111111111111111"));
        assert!(!is_eth_address("0x123"));
        assert!(!is_eth_address("1111111111111111111111111111111111111111"));
    }
}
