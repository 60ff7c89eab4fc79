//! Command Handlers module
//!
//! The transfer orchestrator, its command/result types and the hooks it
//! runs after commit.

mod commands;
pub mod hooks;
mod transfer_handler;

#[cfg(test)]
mod tests;

pub use commands::*;
pub use hooks::{ChannelNotifier, PostCommitHook, TransferNotification};
pub use transfer_handler::{
    add_in_lock_order, execute_transfer_steps, BalanceUpdate, TransferHandler, TransferState,
};
