//! Operation Context
//!
//! Carries request metadata plus the deadline and cancellation signal that
//! bound every store call made on behalf of one operation.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::StoreError;

/// Context for an operation, used for tracing and cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Owner name from the X-Request-User header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_user: Option<String>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    #[serde(skip)]
    deadline: Option<Instant>,

    #[serde(skip)]
    cancel: Option<watch::Receiver<bool>>,
}

/// Sender half of an operation's cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every context holding the receiver
    pub fn cancel(&self) {
        // send_replace never fails even when all receivers are gone
        self.tx.send_replace(true);
    }
}

impl OperationContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self {
            request_user: None,
            correlation_id: None,
            deadline: None,
            cancel: None,
        }
    }

    /// Create context with request user
    pub fn with_request_user(mut self, user: impl Into<String>) -> Self {
        self.request_user = Some(user.into());
        self
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Bound the operation by a timeout starting now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach a cancellation signal and return the handle that fires it
    pub fn with_cancellation(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail if the operation was cancelled or its deadline has passed
    pub fn check(&self) -> Result<(), StoreError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Err(StoreError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the deadline passes, or the
    /// operation is cancelled. On the latter two `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, StoreError>
    where
        F: Future,
    {
        self.check()?;

        let cancelled = wait_cancelled(self.cancel.clone());
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            out = fut => Ok(out),
            _ = cancelled => Err(StoreError::Cancelled),
            _ = expired => Err(StoreError::DeadlineExceeded),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_cancelled(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling
            return std::future::pending().await;
        }
    }
}
