//! bank_ledger Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod domain;
mod error;
pub mod handlers;
pub mod store;

pub use config::Config;
pub use domain::{Account, Entry, OperationContext, Transfer, TransferError};
pub use error::{AppError, AppResult};
pub use handlers::{TransferCommand, TransferHandler, TransferResult};
pub use store::{MemoryLedgerStore, PgLedgerStore, StoreError, UnitOfWork};
