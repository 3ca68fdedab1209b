//! The user function seam.

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use trigger_core::SqlChange;

/// Receives batches of changes.
///
/// Delivery is at-least-once: a batch whose execution fails, or whose worker
/// dies mid-batch, is redelivered once its leases expire. Implementations must
/// tolerate seeing the same change more than once. `cancel` fires when the
/// listener stops or when the batch exceeded its lease renewals.
#[async_trait]
pub trait TriggerExecutor<T>: Send + Sync {
    async fn execute(&self, changes: Vec<SqlChange<T>>, cancel: CancellationToken)
        -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`TriggerExecutor`].
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<T, F, Fut> TriggerExecutor<T> for FnExecutor<F>
where
    T: Send + 'static,
    F: Fn(Vec<SqlChange<T>>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn execute(
        &self,
        changes: Vec<SqlChange<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        (self.func)(changes, cancel).await
    }
}
