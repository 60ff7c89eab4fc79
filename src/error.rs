//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::TransferError;
use crate::store::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Currency mismatch for account {account_id}: {expected} vs {found}")]
    CurrencyMismatch {
        account_id: i64,
        expected: String,
        found: String,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized transfer: request user does not own the source account")]
    UnauthorizedTransfer,

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    // Engine errors
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Transfer(TransferError::from(err))
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }
            AppError::CurrencyMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "currency_mismatch", None)
            }
            AppError::MissingHeader(header) => {
                (StatusCode::BAD_REQUEST, "missing_header", Some(header.clone()))
            }

            // 403 Forbidden
            AppError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, "forbidden", Some(msg.clone()))
            }
            AppError::UnauthorizedTransfer => {
                (StatusCode::FORBIDDEN, "unauthorized_transfer", None)
            }

            // Engine errors - map to appropriate HTTP status
            AppError::Transfer(transfer_err) => match transfer_err {
                TransferError::NotFound(what) => {
                    (StatusCode::NOT_FOUND, "not_found", Some(what.clone()))
                }
                TransferError::InsufficientFunds { .. } => {
                    (StatusCode::BAD_REQUEST, "insufficient_funds", None)
                }
                TransferError::InvalidRequest(msg) => {
                    (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
                }
                TransferError::TransactionAborted(store_err) => match store_err {
                    StoreError::LockTimeout | StoreError::SerializationFailure(_) => {
                        (StatusCode::CONFLICT, "transaction_conflict", None)
                    }
                    StoreError::ConstraintViolation(msg) => {
                        (StatusCode::CONFLICT, "constraint_violation", Some(msg.clone()))
                    }
                    StoreError::DeadlineExceeded => {
                        (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded", None)
                    }
                    StoreError::Cancelled => {
                        (StatusCode::SERVICE_UNAVAILABLE, "cancelled", None)
                    }
                    other => {
                        tracing::error!("Transaction aborted: {:?}", other);
                        (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
                    }
                },
            },
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
