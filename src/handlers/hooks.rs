//! Post-commit hooks
//!
//! Side effects that must only happen once a transfer is durable, such as
//! enqueueing a notification. Hooks run after commit; a failing hook is
//! logged and never affects the committed transfer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::OperationContext;

use super::TransferResult;

/// Callback invoked after a transfer has committed
#[async_trait]
pub trait PostCommitHook: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn after_commit(
        &self,
        ctx: &OperationContext,
        result: &TransferResult,
    ) -> anyhow::Result<()>;
}

/// Message describing a committed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotification {
    pub transfer_id: i64,
    pub from_account_id: i64,
    pub from_owner: String,
    pub to_account_id: i64,
    pub to_owner: String,
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl TransferNotification {
    pub fn from_result(ctx: &OperationContext, result: &TransferResult) -> Self {
        Self {
            transfer_id: result.transfer.id,
            from_account_id: result.from_account.id,
            from_owner: result.from_account.owner.clone(),
            to_account_id: result.to_account.id,
            to_owner: result.to_account.owner.clone(),
            amount: result.transfer.amount,
            currency: result.from_account.currency.clone(),
            correlation_id: ctx.correlation_id,
        }
    }
}

/// Enqueues a `TransferNotification` on a bounded channel.
///
/// Enqueueing never waits: a full or closed queue fails the hook.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    queue: mpsc::Sender<TransferNotification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its queue
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransferNotification>) {
        let (queue, rx) = mpsc::channel(capacity);
        (Self { queue }, rx)
    }
}

#[async_trait]
impl PostCommitHook for ChannelNotifier {
    fn name(&self) -> &'static str {
        "transfer_notification"
    }

    async fn after_commit(
        &self,
        ctx: &OperationContext,
        result: &TransferResult,
    ) -> anyhow::Result<()> {
        let notification = TransferNotification::from_result(ctx, result);

        self.queue
            .try_send(notification)
            .map_err(|e| anyhow::anyhow!("failed to enqueue transfer notification: {}", e))?;

        tracing::debug!(
            transfer_id = result.transfer.id,
            "Transfer notification enqueued"
        );
        Ok(())
    }
}
