//! PostgreSQL Ledger Store
//!
//! Row-level locking is delegated to PostgreSQL: the balance increment is a
//! single `UPDATE ... RETURNING`, which takes the row lock and keeps it until
//! the transaction ends. Every transaction sets a local `lock_timeout`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListTransfersParams, Transfer,
};

use super::{LedgerTx, StoreError, UnitOfWork};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";

/// Ledger store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Create a new store with a database pool
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UnitOfWork for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<PgLedgerTx, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        Ok(PgLedgerTx { tx })
    }
}

/// Transaction handle for `PgLedgerStore`
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn insert_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(entry)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(&params.owner)
        .bind(params.balance)
        .bind(&params.currency)
        .fetch_one(&mut *self.tx)
        .await?;

        if account.balance != 0 {
            self.insert_entry(account.id, account.balance).await?;
        }

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM accounts
            WHERE owner = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(accounts)
    }

    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        let updated = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET balance = balance + $2
            WHERE id = $1 AND balance + $2 >= 0
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(account) = updated {
            return Ok(account);
        }

        // Nothing updated: either the row is missing or the guard rejected it
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        match balance {
            Some(balance) => Err(StoreError::InsufficientFunds {
                account_id,
                balance,
                delta,
            }),
            None => Err(StoreError::NotFound(format!("account {}", account_id))),
        }
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
        self.insert_entry(params.account_id, params.amount).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))
    }

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at FROM entries
            WHERE account_id = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(entries)
    }

    async fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM entries WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(total)
    }

    async fn sum_balances(&mut self) -> Result<i64, StoreError> {
        // A single statement reads from one snapshot
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0)::BIGINT FROM accounts")
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(total)
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("transfer {}", id)))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let transfers = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(transfers)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
