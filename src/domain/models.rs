//! Ledger rows
//!
//! Accounts, entries and transfers as stored by the ledger store.
//! Amounts are signed integers in minor currency units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An account holding a balance in a single currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// One signed balance delta posted against an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A recorded movement of value between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    /// Opening deposit; recorded as an entry when non-zero
    pub balance: i64,
    pub currency: String,
}

impl CreateAccountParams {
    pub fn new(owner: impl Into<String>, balance: i64, currency: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            balance,
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Filter for listing transfers touching an account pair.
///
/// A transfer matches when it leaves `from_account_id` or arrives at
/// `to_account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

impl Transfer {
    /// Whether this transfer matches a listing filter
    pub fn matches(&self, params: &ListTransfersParams) -> bool {
        self.from_account_id == params.from_account_id
            || self.to_account_id == params.to_account_id
    }
}
