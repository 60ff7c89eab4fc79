//! Transfer Handler
//!
//! Moves value between two accounts inside one unit of work.
//!
//! Both balance updates go through the row-locking increment primitive in
//! ascending account-id order, whatever the direction of the transfer. Two
//! transfers over the same pair of accounts therefore always lock the rows
//! in the same order and cannot wait on each other in a cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    Account, CreateEntryParams, CreateTransferParams, OperationContext, TransferError,
};
use crate::store::{run_in_transaction, LedgerTx, StoreError, UnitOfWork};

use super::hooks::PostCommitHook;
use super::{TransferCommand, TransferResult};

/// Attempts made by `execute_with_retry` unless configured otherwise
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts, multiplied by the attempt number
const RETRY_BACKOFF_MS: u64 = 50;

/// Progress of one transfer through its transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Started,
    TransferRecorded,
    EntriesPosted,
    BalancesUpdated,
    Committed,
    RolledBack,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Committed | TransferState::RolledBack)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Started => "started",
            TransferState::TransferRecorded => "transfer_recorded",
            TransferState::EntriesPosted => "entries_posted",
            TransferState::BalancesUpdated => "balances_updated",
            TransferState::Committed => "committed",
            TransferState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A signed change to one account's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub account_id: i64,
    pub delta: i64,
}

impl BalanceUpdate {
    pub fn new(account_id: i64, delta: i64) -> Self {
        Self { account_id, delta }
    }
}

/// Apply two balance updates, lower account id first.
///
/// Returns the updated accounts in argument order.
pub async fn add_in_lock_order<T: LedgerTx>(
    tx: &mut T,
    a: BalanceUpdate,
    b: BalanceUpdate,
) -> Result<(Account, Account), StoreError> {
    if a.account_id < b.account_id {
        let first = tx.add_account_balance(a.account_id, a.delta).await?;
        let second = tx.add_account_balance(b.account_id, b.delta).await?;
        Ok((first, second))
    } else {
        let second = tx.add_account_balance(b.account_id, b.delta).await?;
        let first = tx.add_account_balance(a.account_id, a.delta).await?;
        Ok((first, second))
    }
}

/// The four writes of a transfer, run against an open transaction.
///
/// Record the transfer, post the debit and credit entries, then update
/// both balances in canonical order. The caller owns commit and rollback.
pub async fn execute_transfer_steps<T: LedgerTx>(
    tx: &mut T,
    command: TransferCommand,
) -> Result<TransferResult, TransferError> {
    let transfer = tx
        .create_transfer(CreateTransferParams {
            from_account_id: command.from_account_id,
            to_account_id: command.to_account_id,
            amount: command.amount,
        })
        .await?;
    tracing::debug!(transfer_id = transfer.id, state = %TransferState::TransferRecorded, "Transfer row inserted");

    let from_entry = tx
        .create_entry(CreateEntryParams {
            account_id: command.from_account_id,
            amount: -command.amount,
        })
        .await?;
    let to_entry = tx
        .create_entry(CreateEntryParams {
            account_id: command.to_account_id,
            amount: command.amount,
        })
        .await?;
    tracing::debug!(transfer_id = transfer.id, state = %TransferState::EntriesPosted, "Entries posted");

    let (from_account, to_account) = add_in_lock_order(
        tx,
        BalanceUpdate::new(command.from_account_id, -command.amount),
        BalanceUpdate::new(command.to_account_id, command.amount),
    )
    .await?;
    tracing::debug!(transfer_id = transfer.id, state = %TransferState::BalancesUpdated, "Balances updated");

    Ok(TransferResult::compose(
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    ))
}

/// Handler for transfers between accounts
pub struct TransferHandler<S> {
    store: S,
    hooks: Vec<Arc<dyn PostCommitHook>>,
    max_attempts: u32,
}

impl<S: UnitOfWork> TransferHandler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hooks: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Register a hook run after every committed transfer
    pub fn with_hook(mut self, hook: Arc<dyn PostCommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Total attempts made by `execute_with_retry` (at least one)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute the transfer command
    pub async fn execute(
        &self,
        ctx: &OperationContext,
        command: TransferCommand,
    ) -> Result<TransferResult, TransferError> {
        command.validate()?;

        tracing::debug!(
            from_account_id = command.from_account_id,
            to_account_id = command.to_account_id,
            amount = command.amount,
            correlation_id = ?ctx.correlation_id,
            state = %TransferState::Started,
            "Transfer started"
        );

        let outcome = run_in_transaction(&self.store, ctx, move |tx| {
            Box::pin(execute_transfer_steps(tx, command))
        })
        .await;

        match outcome {
            Ok(result) => {
                tracing::info!(
                    transfer_id = result.transfer.id,
                    from_account_id = command.from_account_id,
                    to_account_id = command.to_account_id,
                    amount = command.amount,
                    correlation_id = ?ctx.correlation_id,
                    state = %TransferState::Committed,
                    "Transfer committed"
                );
                self.run_post_commit_hooks(ctx, &result).await;
                Ok(result)
            }
            Err(e) => {
                if e.is_client_error() {
                    tracing::info!(
                        from_account_id = command.from_account_id,
                        to_account_id = command.to_account_id,
                        error = %e,
                        state = %TransferState::RolledBack,
                        "Transfer rejected"
                    );
                } else {
                    tracing::warn!(
                        from_account_id = command.from_account_id,
                        to_account_id = command.to_account_id,
                        error = %e,
                        retryable = e.is_retryable(),
                        state = %TransferState::RolledBack,
                        "Transfer aborted"
                    );
                }
                Err(e)
            }
        }
    }

    /// Execute the transfer, starting over after retryable aborts
    pub async fn execute_with_retry(
        &self,
        ctx: &OperationContext,
        command: TransferCommand,
    ) -> Result<TransferResult, TransferError> {
        let mut attempt = 1;
        loop {
            match self.execute(ctx, command).await {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt));
                    tracing::warn!(
                        "Retryable transfer abort, retrying (attempt {}/{}): {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    ctx.run(tokio::time::sleep(delay)).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn run_post_commit_hooks(&self, ctx: &OperationContext, result: &TransferResult) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_commit(ctx, result).await {
                tracing::warn!(
                    hook = hook.name(),
                    transfer_id = result.transfer.id,
                    error = %e,
                    "Post-commit hook failed; transfer stays committed"
                );
            }
        }
    }
}
