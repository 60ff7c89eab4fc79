//! Unit of Work
//!
//! The transactional boundary of the ledger store. A `UnitOfWork` opens
//! transactions; a `LedgerTx` is the transaction-scoped handle through which
//! every read and write goes. Commit and rollback consume the handle.
//!
//! Dropping an uncommitted `LedgerTx` discards its writes in every backend,
//! so a panic inside a transaction body behaves like a rollback.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::domain::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListTransfersParams, OperationContext, Transfer,
};

use super::StoreError;

/// Boxed future returned by a transaction body borrowing the handle for `'t`
pub type TxFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

/// Source of ledger transactions
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Tx: LedgerTx;

    /// Begin a new transaction
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Transaction-scoped access to accounts, entries and transfers
#[async_trait]
pub trait LedgerTx: Send + Sized {
    /// Insert an account; a non-zero opening balance is also posted as an entry
    async fn create_account(&mut self, params: &CreateAccountParams)
        -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Read an account and hold its row lock until the transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError>;

    /// Atomically add `delta` to the balance under an exclusive row lock.
    ///
    /// Fails with `InsufficientFunds` without writing when the result would
    /// be negative. The lock is held until commit or rollback.
    async fn add_account_balance(&mut self, account_id: i64, delta: i64)
        -> Result<Account, StoreError>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Sum of every entry posted against an account
    async fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError>;

    /// Sum of every account balance, read from one consistent snapshot
    async fn sum_balances(&mut self) -> Result<i64, StoreError>;

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Run `work` inside one transaction.
///
/// Commits when `work` succeeds; rolls back when it fails, when `ctx` is
/// cancelled or its deadline passes (the body is dropped at its current
/// await point, including a pending row-lock wait). Cancellation is checked
/// once more before commit, so nothing commits after it is observed.
///
/// The handle passed to `work` is a `LedgerTx`, which cannot open another
/// transaction, so calls never nest.
pub async fn run_in_transaction<S, T, E, F>(
    store: &S,
    ctx: &OperationContext,
    work: F,
) -> Result<T, E>
where
    S: UnitOfWork,
    E: From<StoreError>,
    F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T, E>,
{
    let mut tx = ctx
        .run(store.begin())
        .await
        .and_then(|begun| begun)
        .map_err(E::from)?;

    let outcome = ctx.run(work(&mut tx)).await;

    let failure = match outcome {
        Ok(Ok(value)) => match ctx.check() {
            Ok(()) => {
                tx.commit().await.map_err(E::from)?;
                return Ok(value);
            }
            Err(cancelled) => E::from(cancelled),
        },
        Ok(Err(err)) => err,
        Err(cancelled) => {
            tracing::debug!(reason = %cancelled, "Transaction body interrupted");
            E::from(cancelled)
        }
    };

    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Rollback failed, uncommitted writes are discarded with the connection");
    }

    Err(failure)
}
