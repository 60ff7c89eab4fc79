//! Command definitions
//!
//! The transfer command accepted by the engine and the composed result it
//! returns on commit.

use serde::{Deserialize, Serialize};

use crate::domain::{Account, Entry, Transfer, TransferError};

// =========================================================================
// TransferCommand
// =========================================================================

/// Command to move `amount` minor units between two accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferCommand {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Structural checks that need no storage access
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.from_account_id <= 0 || self.to_account_id <= 0 {
            return Err(TransferError::invalid("account ids must be positive"));
        }
        if self.from_account_id == self.to_account_id {
            return Err(TransferError::invalid("cannot transfer to the same account"));
        }
        if self.amount <= 0 {
            return Err(TransferError::invalid(format!(
                "amount must be positive (got {})",
                self.amount
            )));
        }
        Ok(())
    }
}

// =========================================================================
// TransferResult
// =========================================================================

/// Result of a committed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl TransferResult {
    /// Package the rows written by one transfer
    pub fn compose(
        transfer: Transfer,
        from_entry: Entry,
        to_entry: Entry,
        from_account: Account,
        to_account: Account,
    ) -> Self {
        Self {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        }
    }
}
