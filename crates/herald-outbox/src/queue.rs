//! Seam to the external async task-queue runtime.
//!
//! Herald does not execute background jobs itself; in async mode it asks the
//! embedding application's queue to schedule a batch-processing job after
//! the publishing transaction commits. The runtime is specified only at this
//! boundary.

use async_trait::async_trait;

/// External task queue that can schedule outbox batch processing.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a job that will claim and process a batch of outbox entries.
    ///
    /// Called after the publishing transaction has committed. Failures are
    /// logged, not propagated: the entry is already durable and the polling
    /// workers will pick it up regardless.
    async fn enqueue_outbox_batch(&self) -> anyhow::Result<()>;
}

/// Task queue that discards enqueue requests.
///
/// Used when async dispatch is enabled without a real queue, and in tests.
/// Pending entries are still drained by the polling workers.
#[derive(Debug, Default)]
pub struct NoOpTaskQueue;

impl NoOpTaskQueue {
    /// Creates a new no-op queue.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskQueue for NoOpTaskQueue {
    async fn enqueue_outbox_batch(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_op_queue_accepts_enqueues() {
        let queue = NoOpTaskQueue::new();
        assert!(queue.enqueue_outbox_batch().await.is_ok());
    }
}
