//! Transfer Error Types
//!
//! Typed failures surfaced by the transfer engine to its callers.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by the transfer engine.
///
/// Either the full transfer is durably committed or none of it is; every
/// variant below is returned only after the transaction was rolled back
/// (or, for `InvalidRequest`, before one was opened).
#[derive(Debug, Error)]
pub enum TransferError {
    /// A referenced account does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A balance update would have gone negative
    #[error("Insufficient funds in account {account_id}: balance {balance}, change {delta}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        delta: i64,
    },

    /// Any other storage failure
    #[error("Transaction aborted: {0}")]
    TransactionAborted(#[source] StoreError),

    /// Structurally invalid input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InsufficientFunds {
                account_id,
                balance,
                delta,
            } => Self::InsufficientFunds {
                account_id,
                balance,
                delta,
            },
            other => Self::TransactionAborted(other),
        }
    }
}

impl TransferError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Check if this is a client error (the request must change to succeed)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InsufficientFunds { .. } | Self::InvalidRequest(_)
        )
    }

    /// Check if retrying the same request from scratch may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransactionAborted(err) => err.is_retryable(),
            _ => false,
        }
    }
}
