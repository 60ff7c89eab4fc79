//! Ledger Audit
//!
//! Recomputes balances from the entry ledger and compares them with the
//! stored account balances. The stored balance is never trusted on its own:
//! for every account the sum of its entries must equal its balance.

use serde::{Deserialize, Serialize};

use crate::domain::OperationContext;
use crate::store::{run_in_transaction, LedgerTx, StoreError, UnitOfWork};

// =========================================================================
// AccountReconciliation
// =========================================================================

/// Stored balance versus the entry total for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReconciliation {
    pub account_id: i64,
    pub balance: i64,
    pub entries_total: i64,
}

impl AccountReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.entries_total && self.balance >= 0
    }
}

/// Reconcile one account inside an open transaction.
///
/// The account row is locked first so no transfer touching it can commit
/// between reading the balance and summing the entries.
pub async fn reconcile_account<T: LedgerTx>(
    tx: &mut T,
    account_id: i64,
) -> Result<AccountReconciliation, StoreError> {
    let account = tx.get_account_for_update(account_id).await?;
    let entries_total = tx.sum_account_entries(account_id).await?;

    Ok(AccountReconciliation {
        account_id,
        balance: account.balance,
        entries_total,
    })
}

// =========================================================================
// LedgerAudit
// =========================================================================

/// Result of auditing a set of accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    /// Sum of every account balance in the ledger
    pub total_balance: i64,
    pub accounts: Vec<AccountReconciliation>,
}

impl LedgerAudit {
    pub fn mismatches(&self) -> impl Iterator<Item = &AccountReconciliation> {
        self.accounts.iter().filter(|r| !r.is_consistent())
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatches().next().is_none()
    }
}

/// Audit the given accounts and compute the ledger-wide balance total.
///
/// Accounts are reconciled in ascending id order, the same order transfers
/// lock rows in.
pub async fn audit_accounts<S: UnitOfWork>(
    store: &S,
    ctx: &OperationContext,
    account_ids: &[i64],
) -> Result<LedgerAudit, StoreError> {
    let mut ids = account_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let audit = run_in_transaction(store, ctx, move |tx| {
        Box::pin(async move {
            let total_balance = tx.sum_balances().await?;

            let mut accounts = Vec::with_capacity(ids.len());
            for id in ids {
                accounts.push(reconcile_account(tx, id).await?);
            }

            Ok::<_, StoreError>(LedgerAudit {
                total_balance,
                accounts,
            })
        })
    })
    .await?;

    for mismatch in audit.mismatches() {
        tracing::error!(
            account_id = mismatch.account_id,
            balance = mismatch.balance,
            entries_total = mismatch.entries_total,
            "Ledger mismatch: balance differs from entry total"
        );
    }

    Ok(audit)
}
