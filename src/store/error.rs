//! Ledger Store Errors

/// SQLSTATE codes classified by the store
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
pub const UNIQUE_VIOLATION: &str = "23505";
pub const CHECK_VIOLATION: &str = "23514";
pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// Errors that can occur in the ledger store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Balance increment would leave the account negative; nothing was written
    #[error("Insufficient funds in account {account_id}: balance {balance}, change {delta}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        delta: i64,
    },

    /// Waited too long for a row lock
    #[error("Lock wait timeout")]
    LockTimeout,

    /// Serialization failure or deadlock reported by the database
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Check or unique constraint rejected a write, or a value overflowed
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller's deadline passed
    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Check if the failed transaction may succeed when retried from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout | StoreError::SerializationFailure(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    return StoreError::SerializationFailure(message);
                }
                Some(LOCK_NOT_AVAILABLE) => return StoreError::LockTimeout,
                Some(FOREIGN_KEY_VIOLATION) => return StoreError::NotFound(message),
                Some(CHECK_VIOLATION)
                | Some(UNIQUE_VIOLATION)
                | Some(NUMERIC_VALUE_OUT_OF_RANGE) => {
                    return StoreError::ConstraintViolation(message);
                }
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}
