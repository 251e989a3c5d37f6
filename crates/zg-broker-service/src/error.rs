//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use zg_broker_core::BrokerError;
use zg_broker_store::StoreError;

use crate::extractor::ExtractError;
use crate::ledger::LedgerError;
use crate::metadata::{headers, ValidationError};
use crate::upstream::UpstreamError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Resource or route not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Metering headers are missing or inconsistent.
    #[error("invalid request metadata: {message}")]
    InvalidMetadata {
        /// The offending header, if a single one is at fault.
        header: Option<&'static str>,
        /// What is wrong.
        message: String,
    },

    /// The user's locked balance does not cover the request on top of its
    /// unsettled usage.
    #[error("insufficient balance: balance={balance}, required={required}")]
    InsufficientBalance {
        /// Locked balance on the ledger.
        balance: u128,
        /// Fee of the request plus everything not settled yet.
        required: u128,
    },

    /// Conflict - nonce replay or invalid state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::InvalidMetadata { header, message } => (
                StatusCode::BAD_REQUEST,
                "invalid_metadata",
                message.clone(),
                header.map(|h| serde_json::json!({ "header": h })),
            ),
            Self::InsufficientBalance { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_balance",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance.to_string(),
                    "required": required.to_string()
                })),
            ),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::NonceNotIncreasing { .. } => Self::Conflict(err.to_string()),
            other => Self::InvalidMetadata {
                header: other.header(),
                message: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound("usage record not found".into()),
            StoreError::NonceNotIncreasing { .. }
            | StoreError::Duplicate(_)
            | StoreError::ClaimLost(_)
            | StoreError::Conflict(_) => Self::Conflict(err.to_string()),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
            StoreError::Domain(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(_) => Self::InvalidMetadata {
                header: Some(headers::ADDRESS),
                message: err.to_string(),
            },
            other => Self::ExternalService(other.to_string()),
        }
    }
}

impl From<ExtractError> for ApiError {
    fn from(err: ExtractError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        Self::ExternalService(err.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self::Internal(err.to_string())
    }
}
