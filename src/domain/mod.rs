//! Domain module
//!
//! Ledger rows, typed transfer errors and the per-operation context.

pub mod context;
pub mod error;
pub mod models;

pub use context::{CancelHandle, OperationContext};
pub use error::TransferError;
pub use models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListTransfersParams, Transfer,
};
