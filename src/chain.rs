//! Escrow chain verifier
//!
//! Read-only JSON-RPC client for the escrow contract: receipt verification
//! for funding/claim/cancel transactions and lifecycle event queries for the
//! synchronizer. Pure verification, no persistence.
//!
//! Amounts are compared as exact integers in the token's smallest unit.

use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::debug;

use crate::config::ChainConfig;

#[derive(Debug, Error)]
pub enum VerifyError {
    /// Node or transport failure. Retryable.
    #[error("chain RPC unavailable: {0}")]
    Unavailable(String),
    #[error("transaction receipt not found")]
    ReceiptNotFound,
    /// The transaction reverted on-chain. Terminal, never retried.
    #[error("transaction failed on-chain")]
    TransactionFailed,
    #[error("no matching escrow event found in transaction receipt")]
    NoMatchingEvent,
}

// ============================================================================
// EVENT SCHEMA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowEventKind {
    Created,
    Claimed,
    Cancelled,
    Expired,
}

impl EscrowEventKind {
    pub const ALL: [EscrowEventKind; 4] = [
        EscrowEventKind::Created,
        EscrowEventKind::Claimed,
        EscrowEventKind::Cancelled,
        EscrowEventKind::Expired,
    ];

    /// Canonical Solidity event signature.
    pub fn signature(&self) -> &'static str {
        match self {
            EscrowEventKind::Created => {
                "BountyCreated(uint256,address,uint256,uint256)"
            }
            EscrowEventKind::Claimed => "BountyClaimed(uint256,address,uint256)",
            EscrowEventKind::Cancelled => "BountyCancelled(uint256)",
            EscrowEventKind::Expired => "BountyExpired(uint256)",
        }
    }

    /// Event name as recorded in the escrow event log.
    pub fn db_name(&self) -> &'static str {
        match self {
            EscrowEventKind::Created => "BountyCreated",
            EscrowEventKind::Claimed => "BountyClaimed",
            EscrowEventKind::Cancelled => "BountyCancelled",
            EscrowEventKind::Expired => "BountyExpired",
        }
    }

    /// Keccak-256 of the canonical signature, as a 0x-prefixed topic.
    pub fn topic0(&self) -> String {
        let digest = Keccak256::digest(self.signature().as_bytes());
        format!("0x{}", hex::encode(digest))
    }
}

// ============================================================================
// RPC TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxReceipt {
    status: String,
    logs: Vec<RawLog>,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

// ============================================================================
// DECODING
// ============================================================================

fn strip_word(word: &str) -> Option<&str> {
    let word = word.strip_prefix("0x").unwrap_or(word);
    if word.len() == 64 && word.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(word)
    } else {
        None
    }
}

/// Decode one 32-byte big-endian word as u128. The upper 16 bytes must be
/// zero; anything larger is out of range for this contract.
fn decode_word_u128(word: &str) -> Option<u128> {
    let word = strip_word(word)?;
    let (high, low) = word.split_at(32);
    if high.chars().any(|c| c != '0') {
        return None;
    }
    u128::from_str_radix(low, 16).ok()
}

/// Decode an indexed address topic (last 20 bytes), lower-cased.
fn decode_topic_address(word: &str) -> Option<String> {
    let word = strip_word(word)?;
    let (padding, addr) = word.split_at(24);
    if padding.chars().any(|c| c != '0') {
        return None;
    }
    Some(format!("0x{}", addr.to_lowercase()))
}

/// Split an ABI data field into 32-byte words.
fn data_words(data: &str) -> Option<Vec<&str>> {
    let data = data.strip_prefix("0x").unwrap_or(data);
    if data.len() % 64 != 0 || !data.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((0..data.len()).step_by(64).map(|i| &data[i..i + 64]).collect())
}

pub fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.strip_prefix("0x").unwrap_or(value), 16).ok()
}

#[derive(Debug, PartialEq)]
pub struct CreatedEvent {
    pub bounty_id: u128,
    pub employer: String,
    pub amount: u128,
    pub deadline: u64,
}

#[derive(Debug, PartialEq)]
pub struct ClaimedEvent {
    pub bounty_id: u128,
    pub winner: String,
    pub amount: u128,
}

fn decode_created(log: &RawLog) -> Option<CreatedEvent> {
    if log.topics.len() != 3 || log.topics[0] != EscrowEventKind::Created.topic0() {
        return None;
    }
    let words = data_words(&log.data)?;
    if words.len() != 2 {
        return None;
    }
    Some(CreatedEvent {
        bounty_id: decode_word_u128(&log.topics[1])?,
        employer: decode_topic_address(&log.topics[2])?,
        amount: decode_word_u128(words[0])?,
        deadline: u64::try_from(decode_word_u128(words[1])?).ok()?,
    })
}

fn decode_claimed(log: &RawLog) -> Option<ClaimedEvent> {
    if log.topics.len() != 3 || log.topics[0] != EscrowEventKind::Claimed.topic0() {
        return None;
    }
    let words = data_words(&log.data)?;
    if words.len() != 1 {
        return None;
    }
    Some(ClaimedEvent {
        bounty_id: decode_word_u128(&log.topics[1])?,
        winner: decode_topic_address(&log.topics[2])?,
        amount: decode_word_u128(words[0])?,
    })
}

fn decode_bounty_id_only(log: &RawLog, kind: EscrowEventKind) -> Option<u128> {
    if log.topics.len() != 2 || log.topics[0] != kind.topic0() {
        return None;
    }
    decode_word_u128(&log.topics[1])
}

// ============================================================================
// RECEIPT SCANS
// ============================================================================

fn emitted_by<'a>(logs: &'a [RawLog], escrow_address: &'a str) -> impl Iterator<Item = &'a RawLog> {
    logs.iter()
        .filter(move |log| log.address.to_lowercase() == escrow_address)
}

/// First BountyCreated log from the escrow contract whose amount, deadline,
/// and (when supplied) employer match exactly.
fn find_created_match(
    logs: &[RawLog],
    escrow_address: &str,
    expected_amount_units: u128,
    expected_deadline_unix: u64,
    expected_employer: Option<&str>,
) -> Option<CreatedEvent> {
    let expected_employer = expected_employer.map(|a| a.to_lowercase());

    emitted_by(logs, escrow_address)
        .filter_map(decode_created)
        .find(|event| {
            event.amount == expected_amount_units
                && event.deadline == expected_deadline_unix
                && expected_employer
                    .as_deref()
                    .map_or(true, |e| event.employer == e)
        })
}

fn find_claimed_match(
    logs: &[RawLog],
    escrow_address: &str,
    expected_onchain_bounty_id: u128,
    expected_winner: &str,
    expected_amount_units: u128,
) -> Option<ClaimedEvent> {
    let expected_winner = expected_winner.to_lowercase();

    emitted_by(logs, escrow_address)
        .filter_map(decode_claimed)
        .find(|event| {
            event.bounty_id == expected_onchain_bounty_id
                && event.winner == expected_winner
                && event.amount == expected_amount_units
        })
}

fn find_cancelled_match(
    logs: &[RawLog],
    escrow_address: &str,
    expected_onchain_bounty_id: u128,
) -> Option<u128> {
    emitted_by(logs, escrow_address)
        .filter_map(|log| decode_bounty_id_only(log, EscrowEventKind::Cancelled))
        .find(|bounty_id| *bounty_id == expected_onchain_bounty_id)
}

// ============================================================================
// CONFIRMATIONS
// ============================================================================

#[derive(Debug)]
pub struct FundingConfirmation {
    pub onchain_bounty_id: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub employer_address: String,
}

#[derive(Debug)]
pub struct ClaimConfirmation {
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug)]
pub struct CancelConfirmation {
    pub tx_hash: String,
    pub block_number: u64,
}

/// One decoded lifecycle event from a block-range query.
#[derive(Debug)]
pub struct DecodedEscrowEvent {
    pub kind: EscrowEventKind,
    pub onchain_bounty_id: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub payload: Value,
}

// ============================================================================
// CLIENT
// ============================================================================

/// Read-only client for the configured escrow contract. Constructed once at
/// process start and passed by reference; holds no global state.
pub struct EscrowChainClient {
    http: reqwest::Client,
    rpc_url: String,
    escrow_address: String,
}

impl EscrowChainClient {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: config.rpc_url.clone(),
            escrow_address: config.escrow_contract_address.to_lowercase(),
        }
    }

    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, VerifyError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!("rpc call {} to {}", method, self.rpc_url);

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VerifyError::Unavailable(format!(
                "rpc status {}",
                response.status()
            )));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(VerifyError::Unavailable(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }

        Ok(parsed.result)
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<TxReceipt, VerifyError> {
        let receipt: Option<TxReceipt> = self
            .rpc_call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        receipt.ok_or(VerifyError::ReceiptNotFound)
    }

    pub async fn latest_block(&self) -> Result<u64, VerifyError> {
        let number: Option<String> = self.rpc_call("eth_blockNumber", json!([])).await?;
        number
            .as_deref()
            .and_then(parse_hex_u64)
            .ok_or_else(|| VerifyError::Unavailable("malformed block number".into()))
    }

    fn receipt_block(receipt: &TxReceipt) -> Result<u64, VerifyError> {
        parse_hex_u64(&receipt.block_number)
            .ok_or_else(|| VerifyError::Unavailable("malformed block number".into()))
    }

    /// Verify a funding transaction: the receipt must be successful and must
    /// contain a BountyCreated event from the escrow contract whose amount,
    /// deadline, and (when supplied) employer match exactly. First matching
    /// log wins.
    pub async fn verify_funding(
        &self,
        tx_hash: &str,
        expected_amount_units: u128,
        expected_deadline_unix: u64,
        expected_employer: Option<&str>,
    ) -> Result<FundingConfirmation, VerifyError> {
        let receipt = self.get_receipt(tx_hash).await?;
        if receipt.status != "0x1" {
            return Err(VerifyError::TransactionFailed);
        }

        let event = find_created_match(
            &receipt.logs,
            &self.escrow_address,
            expected_amount_units,
            expected_deadline_unix,
            expected_employer,
        )
        .ok_or(VerifyError::NoMatchingEvent)?;

        Ok(FundingConfirmation {
            onchain_bounty_id: event.bounty_id.to_string(),
            block_number: Self::receipt_block(&receipt)?,
            tx_hash: receipt.transaction_hash,
            employer_address: event.employer,
        })
    }

    /// Verify a claim transaction against the expected on-chain bounty id,
    /// winner address (case-insensitive), and exact amount.
    pub async fn verify_claim(
        &self,
        tx_hash: &str,
        expected_onchain_bounty_id: u128,
        expected_winner: &str,
        expected_amount_units: u128,
    ) -> Result<ClaimConfirmation, VerifyError> {
        let receipt = self.get_receipt(tx_hash).await?;
        if receipt.status != "0x1" {
            return Err(VerifyError::TransactionFailed);
        }

        find_claimed_match(
            &receipt.logs,
            &self.escrow_address,
            expected_onchain_bounty_id,
            expected_winner,
            expected_amount_units,
        )
        .ok_or(VerifyError::NoMatchingEvent)?;

        Ok(ClaimConfirmation {
            block_number: Self::receipt_block(&receipt)?,
            tx_hash: receipt.transaction_hash,
        })
    }

    /// Verify a cancellation transaction; only the bounty id must match.
    pub async fn verify_cancel(
        &self,
        tx_hash: &str,
        expected_onchain_bounty_id: u128,
    ) -> Result<CancelConfirmation, VerifyError> {
        let receipt = self.get_receipt(tx_hash).await?;
        if receipt.status != "0x1" {
            return Err(VerifyError::TransactionFailed);
        }

        find_cancelled_match(&receipt.logs, &self.escrow_address, expected_onchain_bounty_id)
            .ok_or(VerifyError::NoMatchingEvent)?;

        Ok(CancelConfirmation {
            block_number: Self::receipt_block(&receipt)?,
            tx_hash: receipt.transaction_hash,
        })
    }

    /// Fetch and decode all four lifecycle event kinds for a block range.
    /// Undecodable logs are skipped; the synchronizer only sees well-formed
    /// events.
    pub async fn fetch_escrow_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<DecodedEscrowEvent>, VerifyError> {
        let mut events = Vec::new();

        for kind in EscrowEventKind::ALL {
            let filter = json!([{
                "address": self.escrow_address,
                "fromBlock": format!("0x{:x}", from_block),
                "toBlock": format!("0x{:x}", to_block),
                "topics": [kind.topic0()],
            }]);

            let logs: Option<Vec<RawLog>> = self.rpc_call("eth_getLogs", filter).await?;

            for log in logs.unwrap_or_default() {
                if let Some(event) = decode_range_log(&log, kind) {
                    events.push(event);
                }
            }
        }

        events.sort_by_key(|e| e.block_number);
        Ok(events)
    }
}

fn decode_range_log(log: &RawLog, kind: EscrowEventKind) -> Option<DecodedEscrowEvent> {
    let tx_hash = log.transaction_hash.clone()?;
    let block_number = log.block_number.as_deref().and_then(parse_hex_u64)?;

    let (bounty_id, payload) = match kind {
        EscrowEventKind::Created => {
            let event = decode_created(log)?;
            (
                event.bounty_id,
                json!({
                    "amount": event.amount.to_string(),
                    "employer": event.employer,
                    "deadline": event.deadline.to_string(),
                }),
            )
        }
        EscrowEventKind::Claimed => {
            let event = decode_claimed(log)?;
            (
                event.bounty_id,
                json!({
                    "amount": event.amount.to_string(),
                    "winner": event.winner,
                }),
            )
        }
        EscrowEventKind::Cancelled | EscrowEventKind::Expired => {
            (decode_bounty_id_only(log, kind)?, json!({}))
        }
    };

    Some(DecodedEscrowEvent {
        kind,
        onchain_bounty_id: bounty_id.to_string(),
        tx_hash,
        block_number,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ESCROW: &str = "0xaabbccddeeff00112233445566778899aabbccdd";
    const EMPLOYER: &str = "0x1111111111111111111111111111111111111111";
    const WINNER: &str = "0x2222222222222222222222222222222222222222";

    fn uint_word(value: u128) -> String {
        format!("0x{:064x}", value)
    }

    fn address_word(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    fn created_log(bounty_id: u128, employer: &str, amount: u128, deadline: u64) -> RawLog {
        RawLog {
            address: ESCROW.to_string(),
            topics: vec![
                EscrowEventKind::Created.topic0(),
                uint_word(bounty_id),
                address_word(employer),
            ],
            data: format!(
                "0x{:064x}{:064x}",
                amount, deadline
            ),
            transaction_hash: Some("0xabc".to_string()),
            block_number: Some("0x10".to_string()),
        }
    }

    fn claimed_log(bounty_id: u128, winner: &str, amount: u128) -> RawLog {
        RawLog {
            address: ESCROW.to_string(),
            topics: vec![
                EscrowEventKind::Claimed.topic0(),
                uint_word(bounty_id),
                address_word(winner),
            ],
            data: format!("0x{:064x}", amount),
            transaction_hash: Some("0xdef".to_string()),
            block_number: Some("0x11".to_string()),
        }
    }

    #[test]
    fn test_decode_word_u128() {
        assert_eq!(decode_word_u128(&uint_word(0)), Some(0));
        assert_eq!(decode_word_u128(&uint_word(1_030_000_000)), Some(1_030_000_000));
        assert_eq!(decode_word_u128(&uint_word(u128::MAX)), Some(u128::MAX));

        // a value above u128 range is rejected
        let oversized = format!("0x1{}", "0".repeat(63));
        assert_eq!(decode_word_u128(&oversized), None);

        assert_eq!(decode_word_u128("0x1234"), None);
        assert_eq!(decode_word_u128("not hex"), None);
    }

    #[test]
    fn test_decode_topic_address() {
        assert_eq!(
            decode_topic_address(&address_word("0xAbCd111111111111111111111111111111111111")),
            Some("0xabcd111111111111111111111111111111111111".to_string())
        );
        // dirty padding is rejected
        let dirty = format!("0x{}{}", "1".repeat(24), "2".repeat(40));
        assert_eq!(decode_topic_address(&dirty), None);
    }

    #[test]
    fn test_decode_created_roundtrip() {
        let log = created_log(7, EMPLOYER, 1_030_000_000, 1_900_000_000);
        let event = decode_created(&log).unwrap();
        assert_eq!(event.bounty_id, 7);
        assert_eq!(event.employer, EMPLOYER);
        assert_eq!(event.amount, 1_030_000_000);
        assert_eq!(event.deadline, 1_900_000_000);
    }

    #[test]
    fn test_decode_created_rejects_other_kinds() {
        let log = claimed_log(7, WINNER, 1_030_000_000);
        assert!(decode_created(&log).is_none());
        assert!(decode_claimed(&log).is_some());
    }

    #[test]
    fn test_decode_cancelled() {
        let log = RawLog {
            address: ESCROW.to_string(),
            topics: vec![EscrowEventKind::Cancelled.topic0(), uint_word(42)],
            data: "0x".to_string(),
            transaction_hash: Some("0x99".to_string()),
            block_number: Some("0x20".to_string()),
        };
        assert_eq!(decode_bounty_id_only(&log, EscrowEventKind::Cancelled), Some(42));
        assert_eq!(decode_bounty_id_only(&log, EscrowEventKind::Expired), None);
    }

    #[test]
    fn test_find_created_skips_other_contracts() {
        let mut foreign = created_log(1, EMPLOYER, 100, 200);
        foreign.address = "0x9999999999999999999999999999999999999999".to_string();

        assert!(find_created_match(&[foreign.clone()], ESCROW, 100, 200, None).is_none());

        // a mixed-case contract address still matches
        let mut upper = created_log(1, EMPLOYER, 100, 200);
        upper.address = ESCROW.to_uppercase().replace("0X", "0x");
        assert!(find_created_match(&[upper], ESCROW, 100, 200, None).is_some());
    }

    #[test]
    fn test_find_created_first_match_wins() {
        let first = created_log(1, EMPLOYER, 100, 200);
        let second = created_log(2, EMPLOYER, 100, 200);

        let found = find_created_match(&[first, second], ESCROW, 100, 200, None).unwrap();
        assert_eq!(found.bounty_id, 1);
    }

    #[test]
    fn test_find_created_mismatches_skipped() {
        let wrong_amount = created_log(1, EMPLOYER, 999, 200);
        let wrong_deadline = created_log(2, EMPLOYER, 100, 999);
        let wrong_employer = created_log(3, WINNER, 100, 200);
        let good = created_log(4, EMPLOYER, 100, 200);

        let logs = [wrong_amount, wrong_deadline, wrong_employer, good];
        let found = find_created_match(&logs, ESCROW, 100, 200, Some(EMPLOYER)).unwrap();
        assert_eq!(found.bounty_id, 4);

        // without an expected employer, the employer check is skipped
        let found = find_created_match(&logs, ESCROW, 100, 200, None).unwrap();
        assert_eq!(found.bounty_id, 3);
    }

    #[test]
    fn test_find_claimed_winner_case_insensitive() {
        let log = claimed_log(5, WINNER, 1_000_000);
        let found =
            find_claimed_match(&[log], ESCROW, 5, &WINNER.to_uppercase().replace("0X", "0x"), 1_000_000);
        assert!(found.is_some());
    }

    #[test]
    fn test_find_cancelled_by_id() {
        let log = RawLog {
            address: ESCROW.to_string(),
            topics: vec![EscrowEventKind::Cancelled.topic0(), uint_word(42)],
            data: "0x".to_string(),
            transaction_hash: Some("0x99".to_string()),
            block_number: Some("0x20".to_string()),
        };
        assert_eq!(find_cancelled_match(&[log.clone()], ESCROW, 42), Some(42));
        assert_eq!(find_cancelled_match(&[log], ESCROW, 43), None);
    }

    #[test]
    fn test_topic0_distinct_per_kind() {
        let topics: Vec<String> = EscrowEventKind::ALL.iter().map(|k| k.topic0()).collect();
        for (i, a) in topics.iter().enumerate() {
            assert!(a.starts_with("0x") && a.len() == 66);
            for b in topics.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x10"), Some(16));
        assert_eq!(parse_hex_u64("0x0"), Some(0));
        assert_eq!(parse_hex_u64("zz"), None);
    }

    #[test]
    fn test_decode_range_log_created_payload() {
        let log = created_log(9, EMPLOYER, 500_000_000, 1_800_000_000);
        let event = decode_range_log(&log, EscrowEventKind::Created).unwrap();
        assert_eq!(event.onchain_bounty_id, "9");
        assert_eq!(event.block_number, 16);
        assert_eq!(event.payload["amount"], "500000000");
        assert_eq!(event.payload["employer"], EMPLOYER);
    }

    #[test]
    fn test_decode_range_log_requires_tx_metadata() {
        let mut log = created_log(9, EMPLOYER, 500_000_000, 1_800_000_000);
        log.transaction_hash = None;
        assert!(decode_range_log(&log, EscrowEventKind::Created).is_none());
    }
}
