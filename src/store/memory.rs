//! In-memory Ledger Store
//!
//! Every account row owns an async write lock. A transaction takes the
//! lock the first time it touches the row for update and keeps the owned
//! guard until it commits or rolls back, mirroring row-level locking in
//! PostgreSQL. Reads see the last committed state without blocking.
//!
//! Writes are staged inside the transaction and published on commit while
//! the row guards are still held, so no other transaction ever observes a
//! partial transfer. Dropping the transaction discards the staged writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::domain::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListTransfersParams, Transfer,
};

use super::{LedgerTx, StoreError, UnitOfWork};

/// Default wait for a row lock before giving up
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// One account row: the write lock plus the last committed state
#[derive(Debug)]
struct AccountSlot {
    write: Arc<tokio::sync::Mutex<()>>,
    committed: RwLock<Account>,
}

impl AccountSlot {
    fn new(account: Account) -> Self {
        Self {
            write: Arc::new(tokio::sync::Mutex::new(())),
            committed: RwLock::new(account),
        }
    }

    fn read_committed(&self) -> Account {
        self.committed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, account: Account) {
        *self
            .committed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = account;
    }
}

#[derive(Debug, Default)]
struct Inner {
    accounts: RwLock<BTreeMap<i64, Arc<AccountSlot>>>,
    entries: Mutex<Vec<Entry>>,
    transfers: Mutex<Vec<Transfer>>,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
}

impl Inner {
    fn slot(&self, id: i64) -> Option<Arc<AccountSlot>> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn account_ids(&self) -> Vec<i64> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn committed_accounts(&self) -> Vec<Account> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|slot| slot.read_committed())
            .collect()
    }

    fn committed_entries(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn committed_transfers(&self) -> Vec<Transfer> {
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Process-local ledger store with per-row locking
#[derive(Debug, Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
    lock_timeout: Duration,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        let inner = Inner {
            next_account_id: AtomicI64::new(1),
            next_entry_id: AtomicI64::new(1),
            next_transfer_id: AtomicI64::new(1),
            ..Default::default()
        };
        Self {
            inner: Arc::new(inner),
            lock_timeout,
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitOfWork for MemoryLedgerStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            inner: Arc::clone(&self.inner),
            lock_timeout: self.lock_timeout,
            locked: BTreeMap::new(),
            new_accounts: Vec::new(),
            new_entries: Vec::new(),
            new_transfers: Vec::new(),
        })
    }
}

/// A row this transaction holds the write lock on
#[derive(Debug)]
struct LockedRow {
    slot: Arc<AccountSlot>,
    staged: Account,
    _guard: OwnedMutexGuard<()>,
}

/// Transaction handle for `MemoryLedgerStore`
#[derive(Debug)]
pub struct MemoryTx {
    inner: Arc<Inner>,
    lock_timeout: Duration,
    locked: BTreeMap<i64, LockedRow>,
    new_accounts: Vec<Account>,
    new_entries: Vec<Entry>,
    new_transfers: Vec<Transfer>,
}

impl MemoryTx {
    /// Account as seen by this transaction, without locking
    fn visible_account(&self, id: i64) -> Option<Account> {
        if let Some(row) = self.locked.get(&id) {
            return Some(row.staged.clone());
        }
        if let Some(account) = self.new_accounts.iter().find(|a| a.id == id) {
            return Some(account.clone());
        }
        self.inner.slot(id).map(|slot| slot.read_committed())
    }

    fn require_account(&self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    /// Lock the row for update (once per transaction) and return its staged state
    async fn lock_row(&mut self, id: i64) -> Result<&mut Account, StoreError> {
        // Rows created by this transaction are invisible to others
        if let Some(pos) = self.new_accounts.iter().position(|a| a.id == id) {
            return Ok(&mut self.new_accounts[pos]);
        }

        if !self.locked.contains_key(&id) {
            let slot = self
                .inner
                .slot(id)
                .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;

            let guard =
                tokio::time::timeout(self.lock_timeout, Arc::clone(&slot.write).lock_owned())
                    .await
                    .map_err(|_| {
                        tracing::warn!(account_id = id, "Row lock wait timed out");
                        StoreError::LockTimeout
                    })?;

            // Committed state can only change under the lock we now hold
            let staged = slot.read_committed();
            self.locked.insert(
                id,
                LockedRow {
                    slot,
                    staged,
                    _guard: guard,
                },
            );
        }

        self.locked
            .get_mut(&id)
            .map(|row| &mut row.staged)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    fn all_entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.inner
            .committed_entries()
            .into_iter()
            .chain(self.new_entries.iter().cloned())
    }

    fn all_transfers(&self) -> impl Iterator<Item = Transfer> + '_ {
        self.inner
            .committed_transfers()
            .into_iter()
            .chain(self.new_transfers.iter().cloned())
    }

    fn push_entry(&mut self, account_id: i64, amount: i64) -> Entry {
        let entry = Entry {
            id: self.inner.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.new_entries.push(entry.clone());
        entry
    }
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, StoreError> {
        if params.balance < 0 {
            return Err(StoreError::ConstraintViolation(
                "account balance must not be negative".to_string(),
            ));
        }

        let duplicate = self
            .inner
            .committed_accounts()
            .iter()
            .chain(self.new_accounts.iter())
            .any(|a| a.owner == params.owner && a.currency == params.currency);
        if duplicate {
            return Err(StoreError::ConstraintViolation(format!(
                "owner {} already has a {} account",
                params.owner, params.currency
            )));
        }

        let account = Account {
            id: self.inner.next_account_id.fetch_add(1, Ordering::SeqCst),
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: Utc::now(),
        };
        self.new_accounts.push(account.clone());

        if account.balance != 0 {
            self.push_entry(account.id, account.balance);
        }

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.lock_row(id).await.map(|account| account.clone())
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self
            .inner
            .account_ids()
            .into_iter()
            .chain(self.new_accounts.iter().map(|a| a.id))
            .filter_map(|id| self.visible_account(id))
            .filter(|a| a.owner == owner)
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(page(accounts, limit, offset))
    }

    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        let account = self.lock_row(account_id).await?;

        let new_balance = account.balance.checked_add(delta).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("balance overflow on account {}", account_id))
        })?;
        if new_balance < 0 {
            return Err(StoreError::InsufficientFunds {
                account_id,
                balance: account.balance,
                delta,
            });
        }

        account.balance = new_balance;
        Ok(account.clone())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
        self.require_account(params.account_id)?;
        Ok(self.push_entry(params.account_id, params.amount))
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.all_entries()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))
    }

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        let mut entries: Vec<Entry> = self
            .all_entries()
            .filter(|e| e.account_id == account_id)
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(page(entries, limit, offset))
    }

    async fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError> {
        Ok(self
            .all_entries()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.amount)
            .sum())
    }

    async fn sum_balances(&mut self) -> Result<i64, StoreError> {
        // Ascending id order, the same order transfers lock in
        let mut balances = Vec::new();
        for id in self.inner.account_ids() {
            balances.push(self.lock_row(id).await?.balance);
        }
        balances.extend(self.new_accounts.iter().map(|a| a.balance));

        balances
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .ok_or_else(|| StoreError::ConstraintViolation("balance total overflow".to_string()))
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        if params.amount <= 0 {
            return Err(StoreError::ConstraintViolation(
                "transfer amount must be positive".to_string(),
            ));
        }
        if params.from_account_id == params.to_account_id {
            return Err(StoreError::ConstraintViolation(
                "transfer accounts must differ".to_string(),
            ));
        }
        self.require_account(params.from_account_id)?;
        self.require_account(params.to_account_id)?;

        let transfer = Transfer {
            id: self.inner.next_transfer_id.fetch_add(1, Ordering::SeqCst),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.new_transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.all_transfers()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer {}", id)))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let mut transfers: Vec<Transfer> = self
            .all_transfers()
            .filter(|t| t.matches(&params))
            .collect();
        transfers.sort_by_key(|t| t.id);
        Ok(page(transfers, params.limit, params.offset))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx {
            inner,
            locked,
            new_accounts,
            new_entries,
            new_transfers,
            ..
        } = self;

        // The accounts map is only write-locked when this transaction creates rows
        let mut accounts = if new_accounts.is_empty() {
            None
        } else {
            let guard = inner
                .accounts
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for account in &new_accounts {
                let taken = guard.values().any(|slot| {
                    let existing = slot.read_committed();
                    existing.owner == account.owner && existing.currency == account.currency
                });
                if taken {
                    return Err(StoreError::ConstraintViolation(format!(
                        "owner {} already has a {} account",
                        account.owner, account.currency
                    )));
                }
            }
            Some(guard)
        };

        inner
            .transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(new_transfers);
        inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(new_entries);

        for row in locked.values() {
            row.slot.publish(row.staged.clone());
        }

        if let Some(accounts) = accounts.as_mut() {
            for account in new_accounts {
                accounts.insert(account.id, Arc::new(AccountSlot::new(account)));
            }
        }
        drop(accounts);

        // Row locks are released here, after everything is published
        drop(locked);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        tracing::debug!(
            locked_rows = self.locked.len(),
            staged_entries = self.new_entries.len(),
            "Discarding in-memory transaction"
        );
        Ok(())
    }
}
