//! Common test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use bank_ledger::domain::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListTransfersParams, Transfer,
};
use bank_ledger::store::{LedgerTx, MemoryLedgerStore, StoreError, UnitOfWork};

// =========================================================================
// In-memory seeding
// =========================================================================

/// Open accounts with the given opening balances, in order
pub async fn open_accounts<S: UnitOfWork>(store: &S, balances: &[i64]) -> Vec<Account> {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    let mut accounts = Vec::with_capacity(balances.len());
    for (i, balance) in balances.iter().enumerate() {
        let account = tx
            .create_account(&CreateAccountParams::new(format!("owner{}", i), *balance, "USD"))
            .await
            .expect("Failed to open account");
        accounts.push(account);
    }
    tx.commit().await.expect("Failed to commit accounts");
    accounts
}

pub async fn balance_of<S: UnitOfWork>(store: &S, account_id: i64) -> i64 {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    let account = tx
        .get_account(account_id)
        .await
        .expect("Account should exist");
    tx.rollback().await.expect("Failed to roll back");
    account.balance
}

pub async fn entries_of<S: UnitOfWork>(store: &S, account_id: i64) -> Vec<Entry> {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    let entries = tx
        .list_entries(account_id, 10_000, 0)
        .await
        .expect("Failed to list entries");
    tx.rollback().await.expect("Failed to roll back");
    entries
}

/// Transfers between `a` and `b` in either direction
pub async fn transfers_between<S: UnitOfWork>(store: &S, a: i64, b: i64) -> Vec<Transfer> {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    // Every transfer leaving or reaching `a`
    let touching_a = tx
        .list_transfers(ListTransfersParams {
            from_account_id: a,
            to_account_id: a,
            limit: 10_000,
            offset: 0,
        })
        .await
        .expect("Failed to list transfers");
    tx.rollback().await.expect("Failed to roll back");
    touching_a
        .into_iter()
        .filter(|t| t.from_account_id == b || t.to_account_id == b)
        .collect()
}

pub async fn total_balance<S: UnitOfWork>(store: &S) -> i64 {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    let total = tx.sum_balances().await.expect("Failed to sum balances");
    tx.rollback().await.expect("Failed to roll back");
    total
}

// =========================================================================
// ScriptedStore: a store wrapper that observes and injects faults
// =========================================================================

/// Wraps another store, records the order balance updates are applied in and
/// optionally fails the Nth balance update of every transaction.
#[derive(Clone)]
pub struct ScriptedStore<S> {
    inner: S,
    balance_updates: Arc<Mutex<Vec<i64>>>,
    fail_balance_update: Option<usize>,
}

impl<S: UnitOfWork> ScriptedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            balance_updates: Arc::new(Mutex::new(Vec::new())),
            fail_balance_update: None,
        }
    }

    /// Fail the `n`th (1-based) balance update in each transaction
    pub fn failing_balance_update(mut self, n: usize) -> Self {
        self.fail_balance_update = Some(n);
        self
    }

    /// Account ids passed to `add_account_balance`, in call order
    pub fn balance_updates(&self) -> Vec<i64> {
        self.balance_updates.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

pub struct ScriptedTx<T> {
    inner: T,
    balance_updates: Arc<Mutex<Vec<i64>>>,
    fail_balance_update: Option<usize>,
    updates_seen: usize,
}

#[async_trait]
impl<S: UnitOfWork> UnitOfWork for ScriptedStore<S> {
    type Tx = ScriptedTx<S::Tx>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(ScriptedTx {
            inner: self.inner.begin().await?,
            balance_updates: Arc::clone(&self.balance_updates),
            fail_balance_update: self.fail_balance_update,
            updates_seen: 0,
        })
    }
}

#[async_trait]
impl<T: LedgerTx> LedgerTx for ScriptedTx<T> {
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, StoreError> {
        self.inner.create_account(params).await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.inner.get_account(id).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.inner.get_account_for_update(id).await
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError> {
        self.inner.list_accounts(owner, limit, offset).await
    }

    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        self.updates_seen += 1;
        self.balance_updates.lock().unwrap().push(account_id);
        if self.fail_balance_update == Some(self.updates_seen) {
            return Err(StoreError::ConstraintViolation("injected fault".to_string()));
        }
        self.inner.add_account_balance(account_id, delta).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
        self.inner.create_entry(params).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.inner.get_entry(id).await
    }

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        self.inner.list_entries(account_id, limit, offset).await
    }

    async fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError> {
        self.inner.sum_account_entries(account_id).await
    }

    async fn sum_balances(&mut self) -> Result<i64, StoreError> {
        self.inner.sum_balances().await
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.inner.create_transfer(params).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.inner.get_transfer(id).await
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.inner.list_transfers(params).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

/// Memory store wrapped for fault injection
pub fn scripted_memory_store() -> ScriptedStore<MemoryLedgerStore> {
    ScriptedStore::new(MemoryLedgerStore::new())
}

// =========================================================================
// PostgreSQL
// =========================================================================

/// Setup test database - connect and apply migrations.
///
/// Tests share the database, so each one opens accounts under its own
/// owner prefix (see `unique_owner`) instead of truncating tables.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    bank_ledger::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Owner name no other test run uses
pub fn unique_owner(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4().simple())
}

/// Open USD accounts for fresh owners with the given opening balances
pub async fn open_unique_accounts<S: UnitOfWork>(store: &S, balances: &[i64]) -> Vec<Account> {
    let mut tx = store.begin().await.expect("Failed to begin transaction");
    let mut accounts = Vec::with_capacity(balances.len());
    for balance in balances {
        let account = tx
            .create_account(&CreateAccountParams::new(unique_owner("owner"), *balance, "USD"))
            .await
            .expect("Failed to open account");
        accounts.push(account);
    }
    tx.commit().await.expect("Failed to commit accounts");
    accounts
}
