//! Circle API client
//!
//! Drives external USD transfers. Every transfer request carries a
//! caller-generated idempotency key so a repeated call can never execute the
//! transfer twice.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CircleConfig;
use crate::store::PayoutStatus;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("circle API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("circle request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("circle API key not configured")]
    MissingApiKey,
}

/// A transfer request to Circle. Amounts are already floored to the
/// provider's 2-decimal USD precision.
#[derive(Debug)]
pub struct TransferRequest<'a> {
    pub idempotency_key: &'a str,
    pub amount_usd2: &'a str,
    pub bank_account_id: &'a str,
    pub destination_currency: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct CircleEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    id: String,
    status: String,
}

/// Map a raw Circle transfer status onto the payout state machine. Unknown
/// strings stay pending; a later poll or webhook resolves them.
pub fn normalize_transfer_status(raw: &str) -> PayoutStatus {
    match raw.to_lowercase().as_str() {
        "complete" | "completed" => PayoutStatus::Completed,
        "failed" => PayoutStatus::Failed,
        "cancelled" => PayoutStatus::Cancelled,
        "processing" => PayoutStatus::Processing,
        _ => PayoutStatus::Pending,
    }
}

pub struct CircleClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl CircleClient {
    pub fn new(config: &CircleConfig, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            warn!("Circle client initialized WITHOUT an API key - withdrawals will fail");
        }
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)?;
        Ok(self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {key}")))
    }

    async fn read_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<CircleEnvelope<T>>().await?.data)
    }

    /// Issue a wire transfer. Safe to retry with the same idempotency key.
    pub async fn create_withdrawal(
        &self,
        request: TransferRequest<'_>,
    ) -> Result<TransferResponse, ProviderError> {
        let payload = json!({
            "idempotencyKey": request.idempotency_key,
            "destination": {
                "type": "wire",
                "id": request.bank_account_id,
            },
            "amount": {
                "amount": request.amount_usd2,
                "currency": "USD",
            },
            "source": {
                "type": "wallet",
            },
            "toAmount": {
                "currency": request.destination_currency,
                "amount": request.amount_usd2,
            },
        });

        debug!(
            "creating circle transfer (idempotency_key: {})",
            request.idempotency_key
        );

        let response = self
            .build_request(reqwest::Method::POST, "/transfers")?
            .json(&payload)
            .send()
            .await?;

        let data: TransferData = Self::read_response(response).await?;
        Ok(TransferResponse {
            id: data.id,
            status: data.status,
        })
    }

    /// Current provider-side status of a transfer.
    pub async fn get_transfer_status(&self, external_ref: &str) -> Result<String, ProviderError> {
        let response = self
            .build_request(reqwest::Method::GET, &format!("/transfers/{external_ref}"))?
            .send()
            .await?;

        let data: TransferData = Self::read_response(response).await?;
        Ok(data.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_transfer_status() {
        assert_eq!(normalize_transfer_status("complete"), PayoutStatus::Completed);
        assert_eq!(normalize_transfer_status("COMPLETED"), PayoutStatus::Completed);
        assert_eq!(normalize_transfer_status("failed"), PayoutStatus::Failed);
        assert_eq!(normalize_transfer_status("cancelled"), PayoutStatus::Cancelled);
        assert_eq!(normalize_transfer_status("processing"), PayoutStatus::Processing);
        assert_eq!(normalize_transfer_status("created"), PayoutStatus::Pending);
        assert_eq!(normalize_transfer_status(""), PayoutStatus::Pending);
    }
}
