//! Ledger Store module
//!
//! Durable storage for accounts, entries and transfers behind the
//! unit-of-work boundary. PostgreSQL is the production backend; the
//! in-memory backend has the same locking semantics and backs tests and
//! local runs without a database.

mod error;
mod memory;
mod postgres;
mod unit_of_work;

pub use error::StoreError;
pub use memory::{MemoryLedgerStore, MemoryTx};
pub use postgres::{PgLedgerStore, PgLedgerTx};
pub use unit_of_work::{run_in_transaction, LedgerTx, TxFuture, UnitOfWork};
