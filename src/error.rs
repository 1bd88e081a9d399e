//! API error taxonomy
//!
//! Caller-correctable conditions surface as specific 4xx responses; anything
//! else collapses to a generic 500 with full detail only in server logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::chain::VerifyError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// Chain verification mismatch. Malformed claim, not a server fault.
    #[error("{0}")]
    Verification(String),
    /// The payment provider call failed after the payout row was written.
    #[error("payment provider request failed")]
    Provider(#[source] anyhow::Error),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Verification(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Provider(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a chain verification failure for a synchronous caller: mismatches
    /// are the caller's problem (400), RPC trouble is ours (500).
    pub fn from_verify(err: VerifyError) -> Self {
        match err {
            VerifyError::Unavailable(_) => ApiError::Internal(err.into()),
            other => ApiError::Verification(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ApiError::Provider(source) => {
                error!("provider call failed: {source:#}");
                "Payment provider request failed".to_string()
            }
            ApiError::Internal(source) => {
                error!("internal error: {source:#}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Verification("mismatch".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Conflict("race".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_verify_error_mapping() {
        // a node outage is never the caller's fault
        let err = ApiError::from_verify(VerifyError::Unavailable("rpc timeout".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // a mismatched event is a malformed claim
        let err = ApiError::from_verify(VerifyError::NoMatchingEvent);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ApiError::from_verify(VerifyError::TransactionFailed);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
