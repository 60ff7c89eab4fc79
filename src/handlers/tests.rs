//! Orchestrator tests against the in-memory store

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::domain::{
        Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, OperationContext,
        TransferError,
    };
    use crate::handlers::{
        ChannelNotifier, PostCommitHook, TransferCommand, TransferHandler, TransferResult,
    };
    use crate::store::{run_in_transaction, LedgerTx, MemoryLedgerStore, StoreError, UnitOfWork};

    async fn open_account(store: &MemoryLedgerStore, owner: &str, balance: i64) -> Account {
        let mut tx = store.begin().await.unwrap();
        let account = tx
            .create_account(&CreateAccountParams::new(owner, balance, "USD"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        account
    }

    async fn balance_of(store: &MemoryLedgerStore, id: i64) -> i64 {
        let mut tx = store.begin().await.unwrap();
        tx.get_account(id).await.unwrap().balance
    }

    /// Transfers between `a` and `b` in either direction
    async fn transfer_count(store: &MemoryLedgerStore, a: i64, b: i64) -> usize {
        let mut tx = store.begin().await.unwrap();
        tx.list_transfers(crate::domain::ListTransfersParams {
            from_account_id: a,
            to_account_id: a,
            limit: 1000,
            offset: 0,
        })
        .await
        .unwrap()
        .iter()
        .filter(|t| t.from_account_id == b || t.to_account_id == b)
        .count()
    }

    // =========================================================================
    // Happy path
    // =========================================================================

    #[tokio::test]
    async fn test_transfer_moves_funds_and_posts_entries() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 50).await;
        let handler = TransferHandler::new(store.clone());

        let result = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 30))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(result.transfer.from_account_id, a.id);
        assert_eq!(result.transfer.to_account_id, b.id);
        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.to_entry.amount, 30);

        assert_eq!(balance_of(&store, a.id).await, 70);
        assert_eq!(balance_of(&store, b.id).await, 80);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 1);
    }

    #[tokio::test]
    async fn test_transfer_from_higher_to_lower_id() {
        let store = MemoryLedgerStore::new();
        let low = open_account(&store, "alice", 10).await;
        let high = open_account(&store, "bob", 40).await;
        let handler = TransferHandler::new(store.clone());

        let result = handler
            .execute(
                &OperationContext::new(),
                TransferCommand::new(high.id, low.id, 15),
            )
            .await
            .unwrap();

        // Result sides follow the request, not the lock order
        assert_eq!(result.from_account.id, high.id);
        assert_eq!(result.from_account.balance, 25);
        assert_eq!(result.to_account.id, low.id);
        assert_eq!(result.to_account.balance, 25);
    }

    #[tokio::test]
    async fn test_exact_balance_transfer_succeeds() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;
        let handler = TransferHandler::new(store.clone());

        let result = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 100))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, 0);
        assert_eq!(result.to_account.balance, 100);
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 50).await;
        let handler = TransferHandler::new(store.clone());

        let err = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 200))
            .await
            .unwrap_err();

        match err {
            TransferError::InsufficientFunds {
                account_id,
                balance,
                delta,
            } => {
                assert_eq!(account_id, a.id);
                assert_eq!(balance, 100);
                assert_eq!(delta, -200);
            }
            other => panic!("Expected InsufficientFunds, got {:?}", other),
        }

        assert_eq!(balance_of(&store, a.id).await, 100);
        assert_eq!(balance_of(&store, b.id).await, 50);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 0);

        let mut tx = store.begin().await.unwrap();
        // Only the opening entries remain
        assert_eq!(tx.list_entries(a.id, 10, 0).await.unwrap().len(), 1);
        assert_eq!(tx.list_entries(b.id, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_after_credit_of_lower_id_rolls_back_credit() {
        let store = MemoryLedgerStore::new();
        let low = open_account(&store, "alice", 5).await;
        let high = open_account(&store, "bob", 10).await;
        let handler = TransferHandler::new(store.clone());

        // The lower id is credited first, then the debit fails
        let err = handler
            .execute(
                &OperationContext::new(),
                TransferCommand::new(high.id, low.id, 11),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
        assert_eq!(balance_of(&store, low.id).await, 5);
        assert_eq!(balance_of(&store, high.id).await, 10);
    }

    #[tokio::test]
    async fn test_same_account_rejected() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let handler = TransferHandler::new(store.clone());

        let err = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, a.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InvalidRequest(_)));
        assert_eq!(balance_of(&store, a.id).await, 100);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let handler = TransferHandler::new(store.clone());

        let err = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, 999, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::NotFound(_)));
        assert_eq!(balance_of(&store, a.id).await, 100);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;
        let handler = TransferHandler::new(store.clone());

        let (ctx, cancel) = OperationContext::new().with_cancellation();
        cancel.cancel();

        let err = handler
            .execute(&ctx, TransferCommand::new(a.id, b.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::TransactionAborted(StoreError::Cancelled)
        ));
        assert_eq!(balance_of(&store, a.id).await, 100);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 0);
    }

    #[tokio::test]
    async fn test_deadline_while_waiting_on_row_lock() {
        let store = MemoryLedgerStore::with_lock_timeout(Duration::from_secs(5));
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;
        let handler = TransferHandler::new(store.clone());

        // Another transaction holds the row lock on `a`
        let mut blocker = store.begin().await.unwrap();
        blocker.get_account_for_update(a.id).await.unwrap();

        let ctx = OperationContext::new().with_timeout(Duration::from_millis(100));
        let err = handler
            .execute(&ctx, TransferCommand::new(a.id, b.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::TransactionAborted(StoreError::DeadlineExceeded)
        ));

        blocker.rollback().await.unwrap();
        assert_eq!(balance_of(&store, a.id).await, 100);
        assert_eq!(balance_of(&store, b.id).await, 0);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 0);
    }

    #[tokio::test]
    async fn test_panic_in_transaction_body_rolls_back() {
        let store = MemoryLedgerStore::with_lock_timeout(Duration::from_millis(500));
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;

        let task_store = store.clone();
        let (from, to) = (a.id, b.id);
        let outcome = tokio::spawn(async move {
            run_in_transaction(&task_store, &OperationContext::new(), move |tx| {
                Box::pin(async move {
                    tx.create_transfer(CreateTransferParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount: 10,
                    })
                    .await?;
                    tx.create_entry(CreateEntryParams {
                        account_id: from,
                        amount: -10,
                    })
                    .await?;
                    let staged = tx.add_account_balance(from, -10).await?;
                    if staged.balance == 90 {
                        panic!("transaction body failed mid-transfer");
                    }
                    Ok::<_, StoreError>(())
                })
            })
            .await
        })
        .await;

        let join_err = outcome.unwrap_err();
        assert!(join_err.is_panic());

        assert_eq!(balance_of(&store, a.id).await, 100);
        assert_eq!(balance_of(&store, b.id).await, 0);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 0);
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.list_entries(a.id, 10, 0).await.unwrap().len(), 1);

        // The row lock went with the dropped transaction
        let updated = tokio::time::timeout(
            Duration::from_millis(100),
            tx.add_account_balance(a.id, 1),
        )
        .await
        .expect("row lock still held after panic")
        .unwrap();
        assert_eq!(updated.balance, 101);
    }

    // =========================================================================
    // Retry
    // =========================================================================

    #[tokio::test]
    async fn test_retry_succeeds_once_lock_is_released() {
        let store = MemoryLedgerStore::with_lock_timeout(Duration::from_millis(30));
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;
        let handler = TransferHandler::new(store.clone()).with_max_attempts(5);

        let mut blocker = store.begin().await.unwrap();
        blocker.get_account_for_update(b.id).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            blocker.rollback().await.unwrap();
        });

        let result = handler
            .execute_with_retry(&OperationContext::new(), TransferCommand::new(a.id, b.id, 10))
            .await
            .unwrap();
        release.await.unwrap();

        assert_eq!(result.from_account.balance, 90);
        assert_eq!(result.to_account.balance, 10);
        assert_eq!(transfer_count(&store, a.id, b.id).await, 1);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_business_failures() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 1).await;
        let b = open_account(&store, "bob", 0).await;
        let handler = TransferHandler::new(store.clone()).with_max_attempts(5);

        let err = handler
            .execute_with_retry(&OperationContext::new(), TransferCommand::new(a.id, b.id, 2))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
    }

    // =========================================================================
    // Post-commit hooks
    // =========================================================================

    /// Records what the store looked like when the hook ran
    struct ObservingHook {
        store: MemoryLedgerStore,
        seen: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl PostCommitHook for ObservingHook {
        fn name(&self) -> &'static str {
            "observing"
        }

        async fn after_commit(
            &self,
            _ctx: &OperationContext,
            result: &TransferResult,
        ) -> anyhow::Result<()> {
            let mut tx = self.store.begin().await?;
            let transfer = tx.get_transfer(result.transfer.id).await?;
            let from = tx.get_account(transfer.from_account_id).await?;
            self.seen.lock().unwrap().push((transfer.id, from.balance));
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl PostCommitHook for FailingHook {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn after_commit(
            &self,
            _ctx: &OperationContext,
            _result: &TransferResult,
        ) -> anyhow::Result<()> {
            anyhow::bail!("queue unavailable")
        }
    }

    #[tokio::test]
    async fn test_hooks_run_after_commit() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;

        let hook = Arc::new(ObservingHook {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let handler = TransferHandler::new(store.clone()).with_hook(hook.clone());

        let result = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 40))
            .await
            .unwrap();

        // The hook already saw the committed transfer and balance
        let seen = hook.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(result.transfer.id, 60)]);
    }

    #[tokio::test]
    async fn test_hooks_skipped_for_failed_transfer() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 10).await;
        let b = open_account(&store, "bob", 0).await;

        let (notifier, mut rx) = ChannelNotifier::new(8);
        let handler = TransferHandler::new(store.clone()).with_hook(Arc::new(notifier));

        let err = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 40))
            .await;
        assert!(err.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_hook_keeps_transfer_committed() {
        let store = MemoryLedgerStore::new();
        let a = open_account(&store, "alice", 100).await;
        let b = open_account(&store, "bob", 0).await;

        let (notifier, mut rx) = ChannelNotifier::new(8);
        let handler = TransferHandler::new(store.clone())
            .with_hook(Arc::new(FailingHook))
            .with_hook(Arc::new(notifier));

        let result = handler
            .execute(&OperationContext::new(), TransferCommand::new(a.id, b.id, 25))
            .await
            .unwrap();

        assert_eq!(balance_of(&store, a.id).await, 75);
        // Later hooks still run
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.transfer_id, result.transfer.id);
    }
}
